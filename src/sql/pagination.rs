use serde::Serialize;
use std::fmt;

/// Bounds applied to caller-supplied page sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationPolicy {
    pub min_page_size: u64,
    pub max_page_size: u64,
    pub default_page_size: u64,
}

impl Default for PaginationPolicy {
    fn default() -> Self {
        Self {
            min_page_size: 1,
            max_page_size: 500,
            default_page_size: 50,
        }
    }
}

/// Which request field was adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectedField {
    Page,
    PageSize,
}

/// Advisory note returned with results when page or page size were
/// clamped to valid bounds. Not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaginationCorrection {
    pub field: CorrectedField,
    pub requested: i64,
    pub applied: u64,
}

impl fmt::Display for PaginationCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.field {
            CorrectedField::Page => "page",
            CorrectedField::PageSize => "page_size",
        };
        write!(f, "{} {} adjusted to {}", name, self.requested, self.applied)
    }
}

/// A normalized page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageWindow {
    pub page: u64,
    pub page_size: u64,
    pub corrections: Vec<PaginationCorrection>,
}

impl PageWindow {
    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaginationMetadata {
    pub page: u64,
    pub page_size: u64,
    pub total_records: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
    pub next_page: Option<u64>,
    pub prev_page: Option<u64>,
}

impl PaginationPolicy {
    /// Clamp page to at least 1 and page size into `[min, max]`; a missing
    /// page size takes the default without a correction note.
    pub fn window(&self, page: i64, page_size: Option<i64>) -> PageWindow {
        let mut corrections = Vec::new();

        let normalized_page = if page < 1 {
            corrections.push(PaginationCorrection {
                field: CorrectedField::Page,
                requested: page,
                applied: 1,
            });
            1
        } else {
            page as u64
        };

        let min = self.min_page_size.max(1);
        let max = self.max_page_size.max(min);
        let normalized_size = match page_size {
            None => self.default_page_size.clamp(min, max),
            Some(requested) => {
                let applied = if requested < min as i64 {
                    min
                } else if requested as u64 > max {
                    max
                } else {
                    requested as u64
                };
                if applied as i64 != requested {
                    corrections.push(PaginationCorrection {
                        field: CorrectedField::PageSize,
                        requested,
                        applied,
                    });
                }
                applied
            }
        };

        PageWindow {
            page: normalized_page,
            page_size: normalized_size,
            corrections,
        }
    }
}

/// Navigation metadata for a page of `total_records` rows.
///
/// `total_pages` is 0 for an empty result and 1 if `page_size` is 0.
pub fn compute(page: u64, page_size: u64, total_records: u64) -> PaginationMetadata {
    let page = page.max(1);
    let total_pages = if page_size == 0 {
        1
    } else {
        total_records.div_ceil(page_size)
    };
    let has_next = page < total_pages;
    let has_prev = page > 1;

    PaginationMetadata {
        page,
        page_size,
        total_records,
        total_pages,
        has_next,
        has_prev,
        next_page: has_next.then_some(page + 1),
        prev_page: has_prev.then_some(page - 1),
    }
}
