use serde::Serialize;

/// Pagination metadata for message-history and conversation pages.
#[derive(Clone, Debug, Serialize)]
pub struct PageInfo {
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
    /// SQL ``OFFSET`` value
    #[serde(skip)]
    pub offset: u64,
}

/// Compute pagination metadata.
///
/// `page` is 1-based and clamped to `[1, total_pages]`; `per_page` is
/// clamped to `[1, 10_000]`.
pub fn paginate(total: u64, page: u64, per_page: u64) -> PageInfo {
    let per_page = per_page.clamp(1, 10_000);
    let total_pages = if total == 0 {
        1
    } else {
        total.div_ceil(per_page)
    };
    let page = page.clamp(1, total_pages);
    let offset = (page - 1) * per_page;

    PageInfo {
        total,
        page,
        per_page,
        total_pages,
        has_next: page < total_pages,
        has_prev: page > 1,
        offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paginate_derives_offsets() {
        let pg = paginate(95, 2, 10);
        assert_eq!(pg.total_pages, 10);
        assert_eq!(pg.offset, 10);
        assert!(pg.has_next);
        assert!(pg.has_prev);
    }

    #[test]
    fn paginate_clamps_page_into_range() {
        let pg = paginate(30, 99, 10);
        assert_eq!(pg.page, 3);
        assert!(!pg.has_next);
    }

    #[test]
    fn paginate_empty_total() {
        let pg = paginate(0, 1, 20);
        assert_eq!(pg.total_pages, 1);
        assert_eq!(pg.offset, 0);
        assert!(!pg.has_next && !pg.has_prev);
    }

}
