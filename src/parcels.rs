//! Parcel lookups over the assessment tables. Every filter value is bound as
//! a parameter and every statement runs through the [`QueryExecutor`].

use serde::Serialize;

use crate::db::ResultRow;
use crate::error::QueryError;
use crate::executor::{QueryExecutor, QueryRequest, QueryResult};
use crate::sql::{DbTarget, SqlParam};

pub const DEFAULT_PER_PAGE: i64 = 10;

const LIST_COLUMNS: &str = "id, parcel_id, address, city, state, zip_code, total_value, \
                            assessment_year, latitude, longitude";

const DETAIL_COLUMNS: &str = "id, parcel_id, address, city, state, zip_code, land_value, \
                              improvement_value, total_value, assessment_year, latitude, \
                              longitude, created_at, updated_at";

const PROPERTY_COLUMNS: &str = "id, property_type, year_built, square_footage, bedrooms, \
                                bathrooms, lot_size, lot_size_unit, condition, quality, \
                                tax_district, zoning";

const SALE_COLUMNS: &str = "id, sale_date, sale_price, sale_type, transaction_id, buyer_name, \
                            seller_name, financing_type";

/// Optional listing filters; absent or blank values add no condition.
#[derive(Debug, Clone, Default)]
pub struct ParcelFilter {
    pub city: Option<String>,
    pub state: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl ParcelFilter {
    fn to_sql(&self) -> (String, Vec<SqlParam>) {
        let mut conditions = Vec::new();
        let mut params = Vec::new();

        let text = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        if let Some(city) = text(&self.city) {
            conditions.push("city = ?");
            params.push(SqlParam::Text(city));
        }
        if let Some(state) = text(&self.state) {
            conditions.push("state = ?");
            params.push(SqlParam::Text(state));
        }
        if let Some(min) = self.min_value {
            conditions.push("total_value >= ?");
            params.push(SqlParam::Float(min));
        }
        if let Some(max) = self.max_value {
            conditions.push("total_value <= ?");
            params.push(SqlParam::Float(max));
        }

        let mut sql = format!("SELECT {} FROM parcels", LIST_COLUMNS);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY id");
        (sql, params)
    }
}

/// One page of parcels matching `filter`.
pub async fn list(
    executor: &QueryExecutor,
    target: DbTarget,
    filter: &ParcelFilter,
    page: i64,
    per_page: Option<i64>,
) -> Result<QueryResult, QueryError> {
    if let (Some(min), Some(max)) = (filter.min_value, filter.max_value) {
        if min > max {
            return Err(QueryError::request_shape("min_value must not exceed max_value"));
        }
    }
    let (sql, params) = filter.to_sql();
    let request = QueryRequest::new(target, sql)
        .with_params(params)
        .page(page)
        .page_size(Some(per_page.unwrap_or(DEFAULT_PER_PAGE)));
    executor.execute(&request).await
}

#[derive(Debug, Clone, Serialize)]
pub struct ParcelDetail {
    #[serde(flatten)]
    pub parcel: ResultRow,
    pub property_details: Vec<ResultRow>,
    pub sales_history: Vec<ResultRow>,
}

/// A parcel with its property records and sales, newest sale first.
/// `None` when no parcel has that id.
pub async fn detail(
    executor: &QueryExecutor,
    target: DbTarget,
    id: i64,
) -> Result<Option<ParcelDetail>, QueryError> {
    let request = QueryRequest::new(
        target,
        format!("SELECT {} FROM parcels WHERE id = ?", DETAIL_COLUMNS),
    )
    .with_params(vec![SqlParam::Integer(id)])
    .page_size(Some(1));
    let Some(parcel) = executor.execute(&request).await?.rows.into_iter().next() else {
        return Ok(None);
    };

    let property_details = executor
        .fetch_all(
            target,
            &format!(
                "SELECT {} FROM properties WHERE parcel_id = ? ORDER BY id",
                PROPERTY_COLUMNS
            ),
            vec![SqlParam::Integer(id)],
        )
        .await?;
    let sales_history = executor
        .fetch_all(
            target,
            &format!(
                "SELECT {} FROM sales WHERE parcel_id = ? ORDER BY sale_date DESC, id DESC",
                SALE_COLUMNS
            ),
            vec![SqlParam::Integer(id)],
        )
        .await?;

    tracing::debug!(
        target_db = %target,
        parcel = id,
        properties = property_details.len(),
        sales = sales_history.len(),
        "parcel detail loaded"
    );
    Ok(Some(ParcelDetail {
        parcel,
        property_details,
        sales_history,
    }))
}
