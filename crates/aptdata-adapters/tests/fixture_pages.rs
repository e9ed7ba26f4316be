use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use aptdata_adapters::sheet::DEFAULT_SHEET_PART;
use aptdata_adapters::{ApiError, FixturePageSource, PageSource, ReaderOptions, RowFilter, SheetError, SheetPackage};
use aptdata_core::Period;
use zip::write::FileOptions;
use zip::CompressionMethod;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn january() -> Period {
    Period::new(2024, 1).expect("period")
}

#[tokio::test]
async fn fixture_source_serves_paginated_xml() {
    let source = FixturePageSource::new(workspace_root().join("fixtures"));

    let first = source
        .fetch_trade_page("11680", january(), 1, 2)
        .await
        .expect("page 1");
    assert_eq!(first.total_count, 3);
    assert_eq!(first.items.len(), 2);

    let second = source
        .fetch_trade_page("11680", january(), 2, 2)
        .await
        .expect("page 2");
    assert_eq!(second.items.len(), 1);
    assert_eq!(
        second.items[0].get("dealAmount").map(String::as_str),
        Some("13,100")
    );

    let past_end = source
        .fetch_trade_page("11680", january(), 3, 2)
        .await
        .expect("page 3");
    assert!(past_end.items.is_empty());
}

#[tokio::test]
async fn fixture_source_serves_json_and_errors() {
    let source = FixturePageSource::new(workspace_root().join("fixtures"));

    let page = source
        .fetch_trade_page("11110", january(), 1, 1000)
        .await
        .expect("json page");
    assert_eq!(page.items[0].get("sggCd").map(String::as_str), Some("11110"));

    let err = source
        .fetch_trade_page("11140", january(), 1, 1000)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Upstream { ref code, .. } if code == "22"));

    assert_eq!(
        source.fetch_household_count("A10027875").await.expect("count"),
        Some(1400)
    );
    assert_eq!(source.fetch_household_count("A00000000").await.expect("count"), None);
}

fn write_xlsx(dir: &Path, sheet_xml: &str) -> PathBuf {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
        let options: FileOptions<'_, ()> =
            FileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file("[Content_Types].xml", options.clone()).expect("start");
        zip.write_all(b"<Types/>").expect("write");
        zip.start_file(DEFAULT_SHEET_PART, options).expect("start");
        zip.write_all(sheet_xml.as_bytes()).expect("write");
        zip.finish().expect("finish");
    }
    let path = dir.join("fees.xlsx");
    std::fs::write(&path, buf).expect("write xlsx");
    path
}

#[test]
fn sheet_package_streams_worksheet_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sheet = [
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>",
        "<worksheet><sheetData>",
        "<row r=\"1\">",
        "<c r=\"A1\" t=\"inlineStr\"><is><t>공동주택 관리비</t></is></c></row>",
        "<row r=\"2\">",
        "<c r=\"A2\" t=\"inlineStr\"><is><t>시도</t></is></c></row>",
        "<row r=\"3\">",
        "<c r=\"A3\" t=\"inlineStr\"><is><t>서울특별시</t></is></c><c r=\"E3\" t=\"inlineStr\"><is><t>A1</t></is></c><c r=\"AA3\"><v>26</v></c></row>",
        "<row r=\"4\">",
        "<c r=\"A4\" t=\"inlineStr\"><is><t>경기도</t></is></c></row>",
        "</sheetData></worksheet>",
    ]
    .join("\n");
    let path = write_xlsx(dir.path(), &sheet);

    let mut package = SheetPackage::open(&path).expect("open");
    let options = ReaderOptions {
        filter: Some(RowFilter::leading("서울")),
        ..Default::default()
    };
    let mut rows = package.rows(DEFAULT_SHEET_PART, options).expect("rows");
    let collected: Vec<_> = rows.by_ref().collect::<Result<_, _>>().expect("read");
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].row.get(4), "A1");
    assert_eq!(collected[0].row.get(26), "26");
    assert_eq!(rows.stats().filtered, 1);
}

#[test]
fn missing_part_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_xlsx(dir.path(), "<worksheet/>");
    let mut package = SheetPackage::open(&path).expect("open");
    let err = package
        .rows("xl/worksheets/sheet9.xml", ReaderOptions::default())
        .err()
        .expect("missing part");
    assert!(matches!(err, SheetError::MissingPart(_)));
}
