//! Terminal UI utilities.
//!
//! - `Table` - box-drawn table that shrinks its widest columns to fit the
//!   terminal. Used for the build report and `fwb cache list`.

use colored::*;
use std::cmp;

/// Narrowest a column is shrunk to before the table is allowed to overflow.
const MIN_COLUMN: usize = 8;

pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Rows with the wrong number of cells are ignored.
    pub fn add_row(&mut self, row: Vec<String>) {
        if row.len() == self.headers.len() {
            self.rows.push(row);
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn print(&self) {
        let (_height, width) = console::Term::stdout().size();
        for line in self.render(width as usize) {
            println!("{}", line);
        }
    }

    fn column_widths(&self, max_width: usize) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                let visible = strip_ansi(&sanitize_content(cell)).chars().count();
                widths[i] = cmp::max(widths[i], visible);
            }
        }

        let overhead = 3 + 3 * self.headers.len();
        let available = max_width.saturating_sub(overhead);
        let mut total: usize = widths.iter().sum();
        while total > available {
            let Some((idx, &widest)) = widths.iter().enumerate().max_by_key(|(_, w)| **w) else {
                break;
            };
            if widest <= MIN_COLUMN {
                break;
            }
            widths[idx] -= 1;
            total -= 1;
        }
        widths
    }

    /// Lay the table out for a terminal `max_width` columns wide.
    pub fn render(&self, max_width: usize) -> Vec<String> {
        if self.headers.is_empty() {
            return Vec::new();
        }
        let widths = self.column_widths(max_width);

        let sep = |left: &str, mid: &str, right: &str| -> String {
            let inner: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
            format!("  {}{}{}", left, inner.join(mid), right)
        };
        let line = |cells: Vec<String>| -> String {
            let mut s = String::from("  │");
            for (cell, width) in cells.iter().zip(&widths) {
                let padding = width.saturating_sub(strip_ansi(cell).chars().count());
                s.push_str(&format!(" {}{} │", cell, " ".repeat(padding)));
            }
            s
        };

        let mut out = vec![sep("┌", "┬", "┐")];
        out.push(line(
            self.headers
                .iter()
                .zip(&widths)
                .map(|(h, w)| truncate(h, *w).bold().to_string())
                .collect(),
        ));
        out.push(sep("├", "┼", "┤"));
        for row in &self.rows {
            out.push(line(
                row.iter()
                    .zip(&widths)
                    .map(|(cell, w)| {
                        console::truncate_str(&sanitize_content(cell), *w, "...").to_string()
                    })
                    .collect(),
            ));
        }
        out.push(sep("└", "┴", "┘"));
        out
    }
}

fn truncate(s: &str, max_width: usize) -> String {
    if s.chars().count() > max_width {
        let mut result: String = s.chars().take(max_width.saturating_sub(3)).collect();
        result.push_str("...");
        result
    } else {
        s.to_string()
    }
}

fn sanitize_content(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\n' | '\r' | '\t' => ' ',
            _ => c,
        })
        .collect()
}

fn strip_ansi(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if let Some(&'[') = chars.peek() {
                chars.next();
                for c in chars.by_ref() {
                    if c == 'm' {
                        break;
                    }
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
