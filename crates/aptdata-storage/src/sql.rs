//! SQL text for the two record tables.
//!
//! Statements are rendered as whole text because the remote store only accepts
//! statement strings; every value goes through [`text`], [`opt_text`] or the
//! numeric helpers.

use std::fmt::Display;

use aptdata_core::{MgmtFeeRecord, Period, TradeRecord, FEE_AMOUNT_COLUMNS};

pub const FEE_TABLE: &str = "apt_mgmt_fee";
pub const TRADE_TABLE: &str = "transactions";

const PER_HOUSEHOLD_COLUMNS: [&str; 8] = [
    "common_per_hh",
    "security_per_hh",
    "cleaning_per_hh",
    "heating_per_hh",
    "electricity_per_hh",
    "water_per_hh",
    "ltm_per_hh",
    "total_per_hh",
];

pub fn text(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn opt_text(value: Option<&str>) -> String {
    value.map(text).unwrap_or_else(|| "NULL".to_string())
}

pub fn num<T: Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "NULL".to_string())
}

pub fn real(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        "NULL".to_string()
    }
}

/// A record that can be written as one row of an `INSERT OR IGNORE`.
pub trait Loadable {
    fn table() -> &'static str;
    fn columns() -> Vec<&'static str>;
    fn natural_key(&self) -> String;
    /// Parenthesised value tuple aligned with [`Loadable::columns`].
    fn sql_values(&self) -> String;
}

pub fn insert_prefix<R: Loadable>() -> String {
    format!(
        "INSERT OR IGNORE INTO {} ({}) VALUES ",
        R::table(),
        R::columns().join(", ")
    )
}

pub fn insert_statement<R: Loadable>(tuples: &[String]) -> String {
    format!("{}{};", insert_prefix::<R>(), tuples.join(","))
}

impl Loadable for MgmtFeeRecord {
    fn table() -> &'static str {
        FEE_TABLE
    }

    fn columns() -> Vec<&'static str> {
        let mut columns = vec!["kapt_code", "apt_nm", "sido", "sgg_nm", "umd_nm", "billing_ym"];
        columns.extend(FEE_AMOUNT_COLUMNS);
        columns.push("ltm_reserve_rate");
        columns.push("household_cnt");
        columns.extend(PER_HOUSEHOLD_COLUMNS);
        columns
    }

    fn natural_key(&self) -> String {
        MgmtFeeRecord::natural_key(self)
    }

    fn sql_values(&self) -> String {
        let mut values = vec![
            text(&self.kapt_code),
            text(&self.apt_nm),
            text(&self.sido),
            text(&self.sgg_nm),
            opt_text(self.umd_nm.as_deref()),
            text(&self.billing_ym.code()),
        ];
        values.extend(
            (0..FEE_AMOUNT_COLUMNS.len()).map(|i| self.amounts.get(i).copied().unwrap_or(0).to_string()),
        );
        values.push(real(self.ltm_reserve_rate));
        values.push(num(self.household_cnt));
        match &self.per_household {
            Some(per) => values.extend(
                [
                    per.common,
                    per.security,
                    per.cleaning,
                    per.heating,
                    per.electricity,
                    per.water,
                    per.ltm,
                    per.total,
                ]
                .iter()
                .map(i64::to_string),
            ),
            None => values.extend(std::iter::repeat("NULL".to_string()).take(PER_HOUSEHOLD_COLUMNS.len())),
        }
        format!("({})", values.join(","))
    }
}

impl Loadable for TradeRecord {
    fn table() -> &'static str {
        TRADE_TABLE
    }

    fn columns() -> Vec<&'static str> {
        vec![
            "deal_amount",
            "exclu_use_ar",
            "deal_amount_billion",
            "area_pyeong",
            "price_per_pyeong",
            "sgg_cd",
            "sgg_nm",
            "umd_nm",
            "umd_cd",
            "apt_nm",
            "jibun",
            "floor",
            "build_year",
            "deal_year",
            "deal_month",
            "deal_day",
            "deal_date",
            "cdeal_day",
            "cdeal_type",
            "apt_seq",
            "bonbun",
            "bubun",
            "road_nm",
        ]
    }

    fn natural_key(&self) -> String {
        TradeRecord::natural_key(self)
    }

    fn sql_values(&self) -> String {
        let values = [
            self.deal_amount.to_string(),
            real(self.exclu_use_ar),
            real(self.deal_amount_billion),
            self.area_pyeong.to_string(),
            self.price_per_pyeong.map(real).unwrap_or_else(|| "NULL".to_string()),
            text(&self.sgg_cd),
            opt_text(self.sgg_nm.as_deref()),
            text(&self.umd_nm),
            opt_text(self.umd_cd.as_deref()),
            text(&self.apt_nm),
            opt_text(self.jibun.as_deref()),
            num(self.floor),
            num(self.build_year),
            self.deal_year.to_string(),
            self.deal_month.to_string(),
            self.deal_day.to_string(),
            text(&self.deal_date),
            opt_text(self.cdeal_day.as_deref()),
            opt_text(self.cdeal_type.as_deref()),
            opt_text(self.apt_seq.as_deref()),
            num(self.bonbun),
            num(self.bubun),
            opt_text(self.road_nm.as_deref()),
        ];
        format!("({})", values.join(","))
    }
}

/// Idempotent DDL for both tables and their natural-key indexes.
pub fn schema() -> String {
    let amounts: String = FEE_AMOUNT_COLUMNS
        .iter()
        .map(|c| format!("  {c} INTEGER NOT NULL DEFAULT 0,\n"))
        .collect();
    let per_household: String = PER_HOUSEHOLD_COLUMNS
        .iter()
        .map(|c| format!(",\n  {c} INTEGER"))
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {FEE_TABLE} (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  kapt_code TEXT NOT NULL,
  apt_nm TEXT NOT NULL,
  sido TEXT NOT NULL,
  sgg_nm TEXT NOT NULL,
  umd_nm TEXT,
  billing_ym TEXT NOT NULL,
{amounts}  ltm_reserve_rate REAL NOT NULL DEFAULT 0,
  household_cnt INTEGER{per_household}
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_{FEE_TABLE}_natural
  ON {FEE_TABLE} (kapt_code, apt_nm, billing_ym);
CREATE INDEX IF NOT EXISTS ix_{FEE_TABLE}_sgg ON {FEE_TABLE} (sgg_nm, billing_ym);
CREATE TABLE IF NOT EXISTS {TRADE_TABLE} (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  deal_amount INTEGER NOT NULL,
  exclu_use_ar REAL NOT NULL,
  deal_amount_billion REAL NOT NULL,
  area_pyeong INTEGER NOT NULL,
  price_per_pyeong REAL,
  sgg_cd TEXT NOT NULL,
  sgg_nm TEXT,
  umd_nm TEXT NOT NULL,
  umd_cd TEXT,
  apt_nm TEXT NOT NULL,
  jibun TEXT,
  floor INTEGER,
  build_year INTEGER,
  deal_year INTEGER NOT NULL,
  deal_month INTEGER NOT NULL,
  deal_day INTEGER NOT NULL,
  deal_date TEXT NOT NULL,
  cdeal_day TEXT,
  cdeal_type TEXT,
  apt_seq TEXT,
  bonbun INTEGER,
  bubun INTEGER,
  road_nm TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_{TRADE_TABLE}_natural
  ON {TRADE_TABLE} (sgg_cd, deal_year, deal_month, COALESCE(apt_seq, apt_nm), deal_day, IFNULL(floor, 0), exclu_use_ar, deal_amount);
CREATE INDEX IF NOT EXISTS ix_{TRADE_TABLE}_period ON {TRADE_TABLE} (deal_year, deal_month);
"
    )
}

pub fn delete_trades_for_period(period: Period) -> String {
    format!(
        "DELETE FROM {TRADE_TABLE} WHERE deal_year = {} AND deal_month = {};",
        period.year(),
        period.month()
    )
}

pub fn count_trades_for_period(period: Period) -> String {
    format!(
        "SELECT COUNT(*) FROM {TRADE_TABLE} WHERE deal_year = {} AND deal_month = {}",
        period.year(),
        period.month()
    )
}

pub fn complexes_missing_households() -> String {
    format!(
        "SELECT DISTINCT kapt_code FROM {FEE_TABLE} WHERE household_cnt IS NULL ORDER BY kapt_code"
    )
}

/// Set a complex's household count and recompute its per-household columns.
pub fn household_update(kapt_code: &str, count: u32) -> String {
    let per = |expr: &str| {
        if count > 0 {
            format!("ROUND(CAST({expr} AS REAL) / {count})")
        } else {
            "NULL".to_string()
        }
    };
    let sources = [
        "common_mgmt_total",
        "security_cost",
        "cleaning_cost",
        "heating_common + heating_indiv",
        "electricity_common + electricity_indiv",
        "water_common + water_indiv",
        "ltm_monthly_charge",
        "common_mgmt_total + indiv_usage_total + ltm_monthly_charge",
    ];
    let assignments: Vec<String> = PER_HOUSEHOLD_COLUMNS
        .iter()
        .zip(sources)
        .map(|(column, expr)| format!("{column} = {}", per(expr)))
        .collect();

    format!(
        "UPDATE {FEE_TABLE} SET household_cnt = {count}, {} WHERE kapt_code = {};",
        assignments.join(", "),
        text(kapt_code)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SqliteStore, Store};
    use aptdata_core::normalize::{normalize_fee_row, MgmtFeeColumns};
    use aptdata_core::RawRow;

    fn fee_record(code: &str, common: &str) -> MgmtFeeRecord {
        let mut cells = vec![String::new(); 48];
        cells[0] = "서울특별시".into();
        cells[1] = "노원구".into();
        cells[4] = code.into();
        cells[5] = "O'Brien 타워".into();
        cells[6] = "202312".into();
        cells[7] = common.into();
        normalize_fee_row(&RawRow::new(cells), &MgmtFeeColumns::default(), None).expect("record")
    }

    #[test]
    fn text_values_escape_quotes() {
        assert_eq!(text("O'Brien"), "'O''Brien'");
        assert_eq!(opt_text(None), "NULL");
        assert_eq!(num::<i64>(None), "NULL");
        assert_eq!(real(f64::NAN), "NULL");
    }

    #[test]
    fn fee_tuple_matches_column_count() {
        let record = fee_record("A1", "10");
        let tuple = record.sql_values();
        let columns = <MgmtFeeRecord as Loadable>::columns();
        assert_eq!(columns.len(), 6 + 40 + 2 + 8);
        // No rendered value contains a comma.
        assert_eq!(tuple.matches(',').count(), columns.len() - 1);
    }

    #[tokio::test]
    async fn schema_is_idempotent_and_accepts_inserts() {
        let store = SqliteStore::in_memory().await.expect("sqlite");
        store.execute(&schema()).await.expect("schema");
        store.execute(&schema()).await.expect("schema again");

        let tuples = vec![fee_record("A1", "900").sql_values(), fee_record("A1", "900").sql_values()];
        let inserted = store
            .execute(&insert_statement::<MgmtFeeRecord>(&tuples))
            .await
            .expect("insert");
        assert_eq!(inserted, 1);

        store.execute(&household_update("A1", 3)).await.expect("update");
        let per = store
            .query_count("SELECT common_per_hh FROM apt_mgmt_fee WHERE kapt_code = 'A1'")
            .await
            .expect("per hh");
        assert_eq!(per, 300);
        assert!(store
            .query_strings(&complexes_missing_households())
            .await
            .expect("codes")
            .is_empty());
    }

    #[test]
    fn zero_households_render_null_per_household_columns() {
        let sql = household_update("A1", 0);
        assert!(sql.contains("household_cnt = 0"));
        assert!(sql.contains("total_per_hh = NULL"));
        assert!(!sql.contains("ROUND"));
    }
}
