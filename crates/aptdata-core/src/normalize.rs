//! Raw cell / API values to typed records.
//!
//! Amounts arrive as locale-formatted text ("13,100"), areas in square metres
//! and counts as free-form numbers. Everything here is total: bad numbers fall
//! back to defaults and only missing identifiers reject a record.

use std::collections::BTreeMap;

use crate::{
    region_name, MgmtFeeRecord, PerHousehold, Period, RawItem, RawRow, TradeRecord,
    ValidationError, FEE_AMOUNT_COLUMNS,
};

/// Square metres in one pyeong.
pub const SQM_PER_PYEONG: f64 = 3.30579;

/// Deal amounts are quoted in units of 10,000 KRW; 10,000 of them make 100M KRW.
const MANWON_PER_EOK: f64 = 10_000.0;

#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    /// Decimal places kept on derived prices.
    pub price_precision: u32,
    /// Only rows whose leading field starts with this are kept.
    pub region_prefix: String,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            price_precision: 1,
            region_prefix: "서울".to_string(),
        }
    }
}

/// Strip thousands separators and parse; `None` for empty or non-finite input.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_count(raw: &str) -> i64 {
    parse_number(raw).map(|v| v.round() as i64).unwrap_or(0)
}

pub fn parse_ratio(raw: &str) -> f64 {
    parse_number(raw).map(|v| round_to(v, 1)).unwrap_or(0.0)
}

pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// `amount / units` rounded, or `None` when the divisor is not positive.
pub fn per_unit(amount: f64, units: f64, precision: u32) -> Option<f64> {
    if units <= 0.0 || !units.is_finite() {
        return None;
    }
    let value = round_to(amount / units, precision);
    value.is_finite().then_some(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitPrice {
    pub amount_billion: f64,
    pub area_pyeong: i64,
    pub price_per_pyeong: Option<f64>,
}

/// Derive the 100M-KRW amount, whole-pyeong area and price per pyeong.
pub fn unit_price(deal_amount: i64, area_sqm: f64, precision: u32) -> UnitPrice {
    let amount_billion = round_to(deal_amount as f64 / MANWON_PER_EOK, precision);
    let area_pyeong = (area_sqm / SQM_PER_PYEONG).round() as i64;
    UnitPrice {
        amount_billion,
        area_pyeong,
        price_per_pyeong: per_unit(amount_billion, area_pyeong as f64, precision),
    }
}

/// Column positions of the management-fee worksheet.
#[derive(Debug, Clone)]
pub struct MgmtFeeColumns {
    pub sido: usize,
    pub sgg_nm: usize,
    pub umd_nm: usize,
    pub kapt_code: usize,
    pub apt_nm: usize,
    pub billing_ym: usize,
    /// One position per entry of [`FEE_AMOUNT_COLUMNS`].
    pub amounts: Vec<usize>,
    pub ltm_reserve_rate: usize,
}

impl Default for MgmtFeeColumns {
    fn default() -> Self {
        // The reserve rate sits between the last reserve amount and misc income.
        let mut amounts: Vec<usize> = (7..=45).collect();
        amounts.push(47);
        debug_assert_eq!(amounts.len(), FEE_AMOUNT_COLUMNS.len());
        Self {
            sido: 0,
            sgg_nm: 1,
            umd_nm: 3,
            kapt_code: 4,
            apt_nm: 5,
            billing_ym: 6,
            amounts,
            ltm_reserve_rate: 46,
        }
    }
}

fn required(row: &RawRow, index: usize, field: &'static str) -> Result<String, ValidationError> {
    let value = row.get(index).trim();
    if value.is_empty() {
        Err(ValidationError::MissingField(field))
    } else {
        Ok(value.to_string())
    }
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Map one worksheet row to a fee record, deriving per-household amounts when
/// a household count for the complex is known.
pub fn normalize_fee_row(
    row: &RawRow,
    columns: &MgmtFeeColumns,
    households: Option<&BTreeMap<String, u32>>,
) -> Result<MgmtFeeRecord, ValidationError> {
    let kapt_code = required(row, columns.kapt_code, "kapt_code")?;
    let apt_nm = required(row, columns.apt_nm, "apt_nm")?;
    let billing_raw = required(row, columns.billing_ym, "billing_ym")?;
    let billing_ym = Period::parse(&billing_raw)
        .map_err(|_| ValidationError::InvalidPeriod(billing_raw.clone()))?;

    let amounts = columns
        .amounts
        .iter()
        .map(|index| parse_count(row.get(*index)))
        .collect();

    let mut record = MgmtFeeRecord {
        sido: row.get(columns.sido).trim().to_string(),
        sgg_nm: row.get(columns.sgg_nm).trim().to_string(),
        umd_nm: optional(row.get(columns.umd_nm)),
        kapt_code,
        apt_nm,
        billing_ym,
        amounts,
        ltm_reserve_rate: parse_ratio(row.get(columns.ltm_reserve_rate)),
        household_cnt: None,
        per_household: None,
    };

    if let Some(count) = households.and_then(|map| map.get(&record.kapt_code)) {
        apply_household_count(&mut record, *count);
    }
    Ok(record)
}

/// Set the household count and recompute per-household amounts.
/// A zero count leaves the derived amounts null.
pub fn apply_household_count(record: &mut MgmtFeeRecord, count: u32) {
    record.household_cnt = Some(count);
    record.per_household = per_household(record, count);
}

fn per_household(record: &MgmtFeeRecord, count: u32) -> Option<PerHousehold> {
    let units = count as f64;
    let share = |total: i64| per_unit(total as f64, units, 0).map(|v| v as i64);
    let sum = |names: &[&str]| names.iter().map(|n| record.amount(n)).sum::<i64>();

    Some(PerHousehold {
        common: share(record.amount("common_mgmt_total"))?,
        security: share(record.amount("security_cost"))?,
        cleaning: share(record.amount("cleaning_cost"))?,
        heating: share(sum(&["heating_common", "heating_indiv"]))?,
        electricity: share(sum(&["electricity_common", "electricity_indiv"]))?,
        water: share(sum(&["water_common", "water_indiv"]))?,
        ltm: share(record.amount("ltm_monthly_charge"))?,
        total: share(sum(&[
            "common_mgmt_total",
            "indiv_usage_total",
            "ltm_monthly_charge",
        ]))?,
    })
}

fn field<'a>(item: &'a RawItem, name: &str) -> &'a str {
    item.get(name).map(|v| v.trim()).unwrap_or("")
}

fn opt_field(item: &RawItem, name: &str) -> Option<String> {
    optional(field(item, name))
}

fn opt_int(item: &RawItem, name: &str) -> Option<i64> {
    parse_number(field(item, name)).map(|v| v.round() as i64)
}

/// Map one upstream trade item to a [`TradeRecord`].
pub fn normalize_trade(item: &RawItem, config: &NormalizeConfig) -> Result<TradeRecord, ValidationError> {
    let apt_nm = opt_field(item, "aptNm").ok_or(ValidationError::MissingField("aptNm"))?;
    let sgg_raw = opt_field(item, "sggCd").ok_or(ValidationError::MissingField("sggCd"))?;
    let deal_year = opt_int(item, "dealYear").ok_or(ValidationError::MissingField("dealYear"))?;
    let deal_month = opt_int(item, "dealMonth").ok_or(ValidationError::MissingField("dealMonth"))?;
    let deal_day = opt_int(item, "dealDay").ok_or(ValidationError::MissingField("dealDay"))?;

    let period = Period::new(deal_year as i32, deal_month as u32)
        .ok_or_else(|| ValidationError::InvalidPeriod(format!("{deal_year}-{deal_month}")))?;

    let deal_amount = parse_count(field(item, "dealAmount"));
    let exclu_use_ar = parse_number(field(item, "excluUseAr")).unwrap_or(0.0);
    let price = unit_price(deal_amount, exclu_use_ar, config.price_precision);

    let sgg_cd = format!("{sgg_raw:0>5}");
    let agent_prefix = format!("{} ", config.region_prefix);
    let sgg_nm = opt_field(item, "estateAgentSggNm")
        .map(|name| name.replacen(&agent_prefix, "", 1))
        .or_else(|| region_name(&sgg_cd).map(str::to_string));

    Ok(TradeRecord {
        deal_amount,
        exclu_use_ar,
        deal_amount_billion: price.amount_billion,
        area_pyeong: price.area_pyeong,
        price_per_pyeong: price.price_per_pyeong,
        sgg_cd,
        sgg_nm,
        umd_nm: field(item, "umdNm").to_string(),
        umd_cd: opt_field(item, "umdCd"),
        apt_nm,
        jibun: opt_field(item, "jibun"),
        floor: opt_int(item, "floor"),
        build_year: opt_int(item, "buildYear"),
        deal_year: period.year(),
        deal_month: period.month(),
        deal_day: deal_day as u32,
        deal_date: format!("{:04}-{:02}-{:02}", period.year(), period.month(), deal_day),
        cdeal_day: opt_field(item, "cdealDay"),
        cdeal_type: opt_field(item, "cdealType"),
        apt_seq: opt_field(item, "aptSeq"),
        bonbun: opt_int(item, "bonbun"),
        bubun: opt_int(item, "bubun"),
        road_nm: opt_field(item, "roadNm"),
    })
}
