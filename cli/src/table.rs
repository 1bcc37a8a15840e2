//! Plain-text column output.

use std::fmt::{self, Display, Write};

/// Spaces between adjacent columns.
const GAP: usize = 3;

type Cell<T> = Box<dyn Fn(&T) -> String>;

pub struct Column<T> {
    header: &'static str,
    cell: Cell<T>,
}

pub struct Table<'a, T> {
    pub cols: Vec<Column<T>>,
    pub data: &'a [T],
}

impl<T> Column<T> {
    pub fn new(header: &'static str, cell: Cell<T>) -> Column<T> {
        Column { header, cell }
    }
}

impl<T> Table<'_, T> {
    /// Renders every cell once so that widths and output agree.
    fn rows(&self) -> Vec<Vec<String>> {
        self.data
            .iter()
            .map(|t| self.cols.iter().map(|col| (col.cell)(t)).collect())
            .collect()
    }

    fn write_row<'s>(
        f: &mut fmt::Formatter<'_>,
        cells: impl Iterator<Item = &'s str>,
        widths: &[usize],
    ) -> fmt::Result {
        let mut line = String::new();
        for (cell, width) in cells.zip(widths) {
            write!(line, "{cell:width$}", width = width + GAP)?;
        }
        // The last column is not padded.
        writeln!(f, "{}", line.trim_end())
    }
}

impl<T> Display for Table<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = self.rows();
        let widths = self
            .cols
            .iter()
            .enumerate()
            .map(|(i, col)| {
                rows.iter()
                    .map(|row| row[i].len())
                    .chain(Some(col.header.len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect::<Vec<_>>();

        Self::write_row(f, self.cols.iter().map(|col| col.header), &widths)?;
        for row in &rows {
            Self::write_row(f, row.iter().map(String::as_str), &widths)?;
        }
        Ok(())
    }
}
