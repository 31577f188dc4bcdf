use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// A record that can be shown as one table row.
pub trait Row: Serialize {
    const HEADER: &'static [&'static str];

    fn cells(&self) -> Vec<String>;
}

#[derive(Serialize)]
struct Report<'a, T> {
    report: &'a str,
    rows: &'a [T],
}

/// Print `rows` as one JSON document, a table, or `key=value` lines.
pub fn print_rows<T: Row>(report: &str, rows: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&Report { report, rows }).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => println!("{}", table(rows)),
        OutputFormat::Pretty => {
            for row in rows {
                println!("{}", pretty_line(row));
            }
        }
    }
}

fn table<T: Row>(rows: &[T]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(T::HEADER.to_vec());
    for row in rows {
        table.add_row(row.cells());
    }
    table
}

fn pretty_line<T: Row>(row: &T) -> String {
    T::HEADER
        .iter()
        .zip(row.cells())
        .map(|(name, value)| format!("{}={value}", name.to_lowercase()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Milliseconds with two decimals.
pub fn millis(duration: std::time::Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}
