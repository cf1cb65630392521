//! Pagination – decides where a fixed-page sink must break between rows.
//!
//! Every page starts with the header row, so the header height is charged
//! against each page. A row that does not fit on the remaining page moves to
//! the next one; a row taller than a whole page still gets a page of its own
//! rather than looping forever.

/// Incremental page-break tracker, fed one row height at a time.
#[derive(Debug, Clone)]
pub struct Paginator {
    content_height: f32,
    header_height: f32,
    used: f32,
    rows_on_page: usize,
    pages: usize,
}

impl Paginator {
    pub fn new(content_height: f32, header_height: f32) -> Self {
        Self {
            content_height,
            header_height,
            used: header_height,
            rows_on_page: 0,
            pages: 1,
        }
    }

    /// Account for a row of `height`. Returns `true` when a page break (and a
    /// header redraw) must be emitted before the row.
    pub fn place_row(&mut self, height: f32) -> bool {
        let overflow = self.used + height > self.content_height && self.rows_on_page > 0;
        if overflow {
            self.pages += 1;
            self.used = self.header_height;
            self.rows_on_page = 0;
        }
        self.used += height;
        self.rows_on_page += 1;
        overflow
    }

    pub fn page_count(&self) -> usize {
        self.pages
    }
}
