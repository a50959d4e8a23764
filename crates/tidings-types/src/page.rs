use serde::{Deserialize, Serialize};

use crate::frame::ValidationError;

pub const MAX_PAGE: u32 = 10_000_000;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Paging request, usually taken from the query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Filter {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl Filter {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }

    pub fn validate(&self, v: &mut ValidationError) {
        v.check(self.page > 0, "page", "must be greater than zero");
        v.check(self.page <= MAX_PAGE, "page", "must be a maximum of 10 million");
        v.check(self.page_size > 0, "page_size", "must be greater than zero");
        v.check(self.page_size <= MAX_PAGE_SIZE, "page_size", "must be a maximum of 100");
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.page_size)
    }
}

/// Describes where a returned page sits in the full result set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "is_zero")]
    pub current_page: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub page_size: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub first_page: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub last_page: u32,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub total_records: u64,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn is_zero_u64(n: &u64) -> bool {
    *n == 0
}

impl Metadata {
    /// An empty result yields all-zero metadata.
    pub fn calculate(total_records: u64, filter: &Filter) -> Self {
        if total_records == 0 || filter.page_size == 0 {
            return Self::default();
        }
        let page_size = u64::from(filter.page_size);
        Self {
            current_page: filter.page,
            page_size: filter.page_size,
            first_page: 1,
            last_page: total_records.div_ceil(page_size) as u32,
            total_records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_and_limit() {
        let f = Filter::new(3, 25);
        assert_eq!(f.limit(), 25);
        assert_eq!(f.offset(), 50);
        assert_eq!(Filter::new(1, 10).offset(), 0);
    }

    #[test]
    fn bounds_are_enforced() {
        let mut v = ValidationError::default();
        Filter::new(0, 101).validate(&mut v);
        assert!(v.error.contains_key("page"));
        assert!(v.error.contains_key("page_size"));

        let mut v = ValidationError::default();
        Filter::new(MAX_PAGE, MAX_PAGE_SIZE).validate(&mut v);
        assert!(v.is_empty());

        let mut v = ValidationError::default();
        Filter::new(MAX_PAGE + 1, 1).validate(&mut v);
        assert_eq!(v.error["page"], "must be a maximum of 10 million");
    }

    #[test]
    fn metadata_rounds_last_page_up() {
        let m = Metadata::calculate(41, &Filter::new(2, 20));
        assert_eq!(m.first_page, 1);
        assert_eq!(m.last_page, 3);
        assert_eq!(m.current_page, 2);
        assert_eq!(m.total_records, 41);

        assert_eq!(Metadata::calculate(0, &Filter::new(1, 20)), Metadata::default());
    }

    #[test]
    fn query_string_defaults() {
        let f: Filter = serde_json::from_str("{}").unwrap();
        assert_eq!(f, Filter::default());
    }
}
