/// Pure, synchronous stages of the query pipeline.
///
/// ```text
/// raw SQL
///       ↓
/// Query Validator        (validator.rs)
///       ↓
/// Parameter Extractor    (params.rs)    canonical `?` placeholders
///       ↓
/// Dialect Adapter        (dialect.rs)   `@Pn` / `$n`, pagination, count
///       ↓
/// Pagination Calculator  (pagination.rs)
/// ```
///
/// Nothing here touches a connection; the executor composes these with a
/// connection provider.
pub mod dialect;
pub mod pagination;
pub mod params;
pub mod validator;

pub use dialect::{
    count_query, is_select_shaped, paginate, to_dialect, DbTarget, Dialect, PlaceholderMismatch,
};
pub use pagination::{
    compute as compute_pagination, PageWindow, PaginationCorrection, PaginationMetadata,
    PaginationPolicy,
};
pub use params::{extract, Extraction, SqlParam};
pub use validator::{QueryValidator, Severity, ValidationVerdict, Violation};
