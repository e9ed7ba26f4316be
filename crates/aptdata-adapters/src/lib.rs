//! Source adapters: the packaged worksheet reader and the public data API.

pub mod api;
pub mod sheet;

pub use api::{
    parse_household_count, parse_trade_page, ApiError, FixturePageSource, PageSource,
    PublicDataClient, TradePage,
};
pub use sheet::{
    decode_row, ReaderOptions, RowFilter, SheetError, SheetPackage, SheetRows, SheetStats,
    SourceRow,
};

pub const CRATE_NAME: &str = "aptdata-adapters";
