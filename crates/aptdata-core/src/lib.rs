//! Core domain model for the apartment data pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod normalize;

pub const CRATE_NAME: &str = "aptdata-core";

/// Upstream item as delivered by the public data API: field name -> text value.
pub type RawItem = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid period `{0}`")]
    InvalidPeriod(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid period `{0}`, expected YYYYMM")]
pub struct PeriodError(pub String);

/// A calendar month, rendered as `YYYYMM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && (1000..=9999).contains(&year) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    /// Accepts exactly six digits `YYYYMM`, or `YYYY-MM` optionally followed
    /// by a `-DD` day.
    pub fn parse(raw: &str) -> Result<Self, PeriodError> {
        let bad = || PeriodError(raw.to_string());
        let trimmed = raw.trim();
        let (year, month) = match trimmed.split_once('-') {
            Some((year, rest)) => (year, rest.split_once('-').map_or(rest, |(month, _)| month)),
            None if trimmed.len() == 6 && trimmed.is_ascii() => trimmed.split_at(4),
            None => return Err(bad()),
        };
        let digits = |part: &str, len: usize| part.len() == len && part.bytes().all(|b| b.is_ascii_digit());
        if !digits(year, 4) || !digits(month, 2) {
            return Err(bad());
        }
        let year = year.parse().map_err(|_| bad())?;
        let month = month.parse().map_err(|_| bad())?;
        Self::new(year, month).ok_or_else(bad)
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn code(&self) -> String {
        self.to_string()
    }

    pub fn shift(self, months: i32) -> Self {
        let index = self.year * 12 + self.month as i32 - 1 + months;
        Self {
            year: index.div_euclid(12),
            month: index.rem_euclid(12) as u32 + 1,
        }
    }

    /// The `count` months ending with the month of `today`, oldest first.
    pub fn trailing(today: NaiveDate, count: usize) -> Vec<Self> {
        let current = Self::from_date(today);
        (0..count as i32)
            .rev()
            .map(|back| current.shift(-back))
            .collect()
    }

    /// Inclusive month range; empty when `end` precedes `start`.
    pub fn range(start: Self, end: Self) -> Vec<Self> {
        let mut out = Vec::new();
        let mut cursor = start;
        while cursor <= end {
            out.push(cursor);
            cursor = cursor.shift(1);
        }
        out
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Period {
    type Error = PeriodError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.code()
    }
}

/// Positional cell values of one worksheet row. Reads past the end yield `""`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    cells: Vec<String>,
}

impl RawRow {
    pub fn new(cells: Vec<String>) -> Self {
        Self { cells }
    }

    pub fn get(&self, index: usize) -> &str {
        self.cells.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.cells
    }

    pub fn into_cells(self) -> Vec<String> {
        self.cells
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub code: &'static str,
    pub name: &'static str,
}

pub const SEOUL_DISTRICTS: [Region; 25] = [
    Region { code: "11110", name: "종로구" },
    Region { code: "11140", name: "중구" },
    Region { code: "11170", name: "용산구" },
    Region { code: "11200", name: "성동구" },
    Region { code: "11215", name: "광진구" },
    Region { code: "11230", name: "동대문구" },
    Region { code: "11260", name: "중랑구" },
    Region { code: "11290", name: "성북구" },
    Region { code: "11305", name: "강북구" },
    Region { code: "11320", name: "도봉구" },
    Region { code: "11350", name: "노원구" },
    Region { code: "11380", name: "은평구" },
    Region { code: "11410", name: "서대문구" },
    Region { code: "11440", name: "마포구" },
    Region { code: "11470", name: "양천구" },
    Region { code: "11500", name: "강서구" },
    Region { code: "11530", name: "구로구" },
    Region { code: "11545", name: "금천구" },
    Region { code: "11560", name: "영등포구" },
    Region { code: "11590", name: "동작구" },
    Region { code: "11620", name: "관악구" },
    Region { code: "11650", name: "서초구" },
    Region { code: "11680", name: "강남구" },
    Region { code: "11710", name: "송파구" },
    Region { code: "11740", name: "강동구" },
];

pub fn region_name(code: &str) -> Option<&'static str> {
    SEOUL_DISTRICTS
        .iter()
        .find(|r| r.code == code)
        .map(|r| r.name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Pending,
    Completed,
    Error,
}

/// One (region, period) unit of API retrieval work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestTarget {
    pub region_code: String,
    pub region_name: String,
    #[serde(rename = "yearMonth")]
    pub period: Period,
    pub status: TargetStatus,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub count: Option<u64>,
}

impl HarvestTarget {
    pub fn pending(region: &Region, period: Period) -> Self {
        Self {
            region_code: region.code.to_string(),
            region_name: region.name.to_string(),
            period,
            status: TargetStatus::Pending,
            attempt: 0,
            count: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TargetStatus::Pending
    }

    pub fn key(&self) -> (String, Period) {
        (self.region_code.clone(), self.period)
    }

    /// Returns false (and changes nothing) unless the target is still pending.
    pub fn mark_completed(&mut self, count: u64) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = TargetStatus::Completed;
        self.count = Some(count);
        true
    }

    pub fn mark_error(&mut self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = TargetStatus::Error;
        true
    }
}

/// Amount columns of the management-fee table, in worksheet order.
pub const FEE_AMOUNT_COLUMNS: [&str; 40] = [
    "common_mgmt_total",
    "labor_cost",
    "office_cost",
    "tax_fee",
    "clothing_cost",
    "training_cost",
    "vehicle_cost",
    "other_overhead",
    "cleaning_cost",
    "security_cost",
    "disinfection_cost",
    "elevator_cost",
    "network_cost",
    "repair_cost",
    "facility_cost",
    "safety_cost",
    "disaster_cost",
    "trust_mgmt_fee",
    "indiv_usage_total",
    "heating_common",
    "heating_indiv",
    "hot_water_common",
    "hot_water_indiv",
    "gas_common",
    "gas_indiv",
    "electricity_common",
    "electricity_indiv",
    "water_common",
    "water_indiv",
    "tv_fee",
    "sewage_fee",
    "waste_fee",
    "tenant_rep_cost",
    "insurance_cost",
    "election_cost",
    "other_indiv",
    "ltm_monthly_charge",
    "ltm_monthly_use",
    "ltm_total_reserve",
    "misc_income",
];

pub fn fee_column_position(name: &str) -> Option<usize> {
    FEE_AMOUNT_COLUMNS.iter().position(|c| *c == name)
}

/// Monthly per-household averages, each rounded to whole won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerHousehold {
    pub common: i64,
    pub security: i64,
    pub cleaning: i64,
    pub heating: i64,
    pub electricity: i64,
    pub water: i64,
    pub ltm: i64,
    pub total: i64,
}

/// One complex's management fees for one billing month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MgmtFeeRecord {
    pub kapt_code: String,
    pub apt_nm: String,
    pub sido: String,
    pub sgg_nm: String,
    pub umd_nm: Option<String>,
    pub billing_ym: Period,
    /// Aligned with [`FEE_AMOUNT_COLUMNS`].
    pub amounts: Vec<i64>,
    pub ltm_reserve_rate: f64,
    pub household_cnt: Option<u32>,
    pub per_household: Option<PerHousehold>,
}

impl MgmtFeeRecord {
    pub fn amount(&self, column: &str) -> i64 {
        fee_column_position(column)
            .and_then(|i| self.amounts.get(i).copied())
            .unwrap_or(0)
    }

    pub fn natural_key(&self) -> String {
        format!("{}|{}|{}", self.kapt_code, self.apt_nm, self.billing_ym)
    }
}

/// One apartment sale as reported by the transaction API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub deal_amount: i64,
    pub exclu_use_ar: f64,
    pub deal_amount_billion: f64,
    pub area_pyeong: i64,
    pub price_per_pyeong: Option<f64>,
    pub sgg_cd: String,
    pub sgg_nm: Option<String>,
    pub umd_nm: String,
    pub umd_cd: Option<String>,
    pub apt_nm: String,
    pub jibun: Option<String>,
    pub floor: Option<i64>,
    pub build_year: Option<i64>,
    pub deal_year: i32,
    pub deal_month: u32,
    pub deal_day: u32,
    pub deal_date: String,
    pub cdeal_day: Option<String>,
    pub cdeal_type: Option<String>,
    pub apt_seq: Option<String>,
    pub bonbun: Option<i64>,
    pub bubun: Option<i64>,
    pub road_nm: Option<String>,
}

impl TradeRecord {
    pub fn period(&self) -> Option<Period> {
        Period::new(self.deal_year, self.deal_month)
    }

    pub fn natural_key(&self) -> String {
        format!(
            "{}|{:04}{:02}|{}|{}|{}|{}|{}",
            self.sgg_cd,
            self.deal_year,
            self.deal_month,
            self.apt_seq.as_deref().unwrap_or(&self.apt_nm),
            self.deal_day,
            self.floor.map(|f| f.to_string()).unwrap_or_default(),
            self.exclu_use_ar,
            self.deal_amount
        )
    }
}
