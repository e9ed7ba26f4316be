//! Public data portal client and the page-source capability.

use std::path::{Path, PathBuf};

use aptdata_core::{Period, RawItem};
use aptdata_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://apis.data.go.kr/1613000";
pub const TRADE_PATH: &str = "/RTMSDataSvcAptTradeDev/getRTMSDataSvcAptTradeDev";
pub const COMPLEX_INFO_PATH: &str = "/AptBasisInfoServiceV4/getAphusBassInfoV4";
pub const MAX_PAGE_SIZE: u32 = 1000;

const SUCCESS_CODES: [&str; 3] = ["0", "00", "000"];

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("public data API error {code}: {message}")]
    Upstream { code: String, message: String },
    #[error("could not decode API response: {0}")]
    Decode(String),
    #[error("invalid API url: {0}")]
    Url(String),
    #[error("fixture {}: {source}", .path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradePage {
    pub items: Vec<RawItem>,
    pub total_count: u64,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_trade_page(
        &self,
        region_code: &str,
        period: Period,
        page: u32,
        page_size: u32,
    ) -> Result<TradePage, ApiError>;

    /// Household count of one complex, `None` when the upstream has no figure.
    async fn fetch_household_count(&self, kapt_code: &str) -> Result<Option<u32>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct XmlEnvelope {
    header: XmlHeader,
    #[serde(default)]
    body: Option<XmlBody>,
}

#[derive(Debug, Deserialize)]
struct XmlHeader {
    #[serde(rename = "resultCode")]
    result_code: String,
    #[serde(rename = "resultMsg", default)]
    result_msg: String,
}

#[derive(Debug, Deserialize)]
struct XmlBody {
    #[serde(default)]
    items: Option<XmlItems>,
    #[serde(rename = "totalCount", default)]
    total_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct XmlItems {
    #[serde(default)]
    item: Vec<RawItem>,
}

/// Gateway-level failures (bad key, quota) use a different envelope.
#[derive(Debug, Deserialize)]
struct XmlServiceError {
    #[serde(rename = "cmmMsgHeader")]
    header: XmlServiceErrorHeader,
}

#[derive(Debug, Deserialize)]
struct XmlServiceErrorHeader {
    #[serde(rename = "errMsg", default)]
    err_msg: String,
    #[serde(rename = "returnAuthMsg", default)]
    return_auth_msg: String,
    #[serde(rename = "returnReasonCode", default)]
    return_reason_code: String,
}

fn check_result_code(code: &str, message: &str) -> Result<(), ApiError> {
    if SUCCESS_CODES.contains(&code.trim()) {
        Ok(())
    } else {
        Err(ApiError::Upstream {
            code: code.trim().to_string(),
            message: message.trim().to_string(),
        })
    }
}

/// Parse one trade page in either XML or JSON form.
pub fn parse_trade_page(body: &str) -> Result<TradePage, ApiError> {
    let body = body.trim_start_matches('\u{feff}').trim();
    if body.starts_with('{') {
        parse_trade_page_json(body)
    } else {
        parse_trade_page_xml(body)
    }
}

fn parse_trade_page_xml(body: &str) -> Result<TradePage, ApiError> {
    if body.contains("<OpenAPI_ServiceResponse") {
        let err: XmlServiceError =
            quick_xml::de::from_str(body).map_err(|e| ApiError::Decode(e.to_string()))?;
        let message = if err.header.return_auth_msg.is_empty() {
            err.header.err_msg
        } else {
            err.header.return_auth_msg
        };
        return Err(ApiError::Upstream {
            code: err.header.return_reason_code,
            message,
        });
    }

    let envelope: XmlEnvelope =
        quick_xml::de::from_str(body).map_err(|e| ApiError::Decode(e.to_string()))?;
    check_result_code(&envelope.header.result_code, &envelope.header.result_msg)?;

    let Some(body) = envelope.body else {
        return Ok(TradePage::default());
    };
    let items: Vec<RawItem> = body
        .items
        .map(|items| items.item)
        .unwrap_or_default()
        .into_iter()
        .map(|item| item.into_iter().map(|(k, v)| (k, v.trim().to_string())).collect())
        .collect();
    Ok(TradePage {
        total_count: body.total_count.unwrap_or(items.len() as u64),
        items,
    })
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

fn json_item(value: &JsonValue) -> Option<RawItem> {
    let object = value.as_object()?;
    Some(
        object
            .iter()
            .filter_map(|(k, v)| json_text(v).map(|v| (k.clone(), v)))
            .collect(),
    )
}

/// A single item arrives as an object, several as an array, none as `""`.
fn json_items(value: Option<&JsonValue>) -> Vec<&JsonValue> {
    match value {
        Some(JsonValue::Array(items)) => items.iter().collect(),
        Some(item @ JsonValue::Object(_)) => vec![item],
        _ => Vec::new(),
    }
}

fn json_header_check(root: &JsonValue) -> Result<(), ApiError> {
    let header = &root["response"]["header"];
    match header.get("resultCode").and_then(json_text) {
        Some(code) => {
            let message = header.get("resultMsg").and_then(json_text).unwrap_or_default();
            check_result_code(&code, &message)
        }
        None => Ok(()),
    }
}

fn parse_trade_page_json(body: &str) -> Result<TradePage, ApiError> {
    let root: JsonValue = serde_json::from_str(body).map_err(|e| ApiError::Decode(e.to_string()))?;
    json_header_check(&root)?;

    let payload = &root["response"]["body"];
    let items: Vec<RawItem> = json_items(payload["items"].get("item"))
        .into_iter()
        .filter_map(json_item)
        .collect();
    let total_count = payload
        .get("totalCount")
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .unwrap_or(items.len() as u64);
    Ok(TradePage { items, total_count })
}

/// Household count (`kaptdaCnt`) from a complex basic-info response.
pub fn parse_household_count(body: &str) -> Result<Option<u32>, ApiError> {
    let root: JsonValue =
        serde_json::from_str(body.trim()).map_err(|e| ApiError::Decode(e.to_string()))?;
    json_header_check(&root)?;

    let item = &root["response"]["body"]["item"];
    let item = match item {
        JsonValue::Array(items) => items.first().unwrap_or(&JsonValue::Null),
        other => other,
    };
    Ok(item
        .get("kaptdaCnt")
        .and_then(json_text)
        .and_then(|raw| aptdata_core::normalize::parse_number(&raw))
        .filter(|n| *n >= 0.0)
        .map(|n| n.round() as u32))
}

/// Live client for the public data portal.
#[derive(Debug, Clone)]
pub struct PublicDataClient {
    http: HttpFetcher,
    base_url: String,
    service_key: String,
}

impl PublicDataClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        }
    }

    fn url(&self, path: &str, params: &[(&str, String)]) -> Result<reqwest::Url, ApiError> {
        let mut query: Vec<(&str, &str)> = vec![("serviceKey", self.service_key.as_str())];
        query.extend(params.iter().map(|(k, v)| (*k, v.as_str())));
        reqwest::Url::parse_with_params(&format!("{}{}", self.base_url, path), &query)
            .map_err(|e| ApiError::Url(e.to_string()))
    }

    async fn get_text(&self, label: &str, url: reqwest::Url) -> Result<String, ApiError> {
        let response = self.http.fetch_bytes(label, url).await?;
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }
}

#[async_trait]
impl PageSource for PublicDataClient {
    async fn fetch_trade_page(
        &self,
        region_code: &str,
        period: Period,
        page: u32,
        page_size: u32,
    ) -> Result<TradePage, ApiError> {
        let url = self.url(
            TRADE_PATH,
            &[
                ("LAWD_CD", region_code.to_string()),
                ("DEAL_YMD", period.code()),
                ("pageNo", page.to_string()),
                ("numOfRows", page_size.clamp(1, MAX_PAGE_SIZE).to_string()),
            ],
        )?;
        let body = self.get_text("apt_trade", url).await?;
        parse_trade_page(&body)
    }

    async fn fetch_household_count(&self, kapt_code: &str) -> Result<Option<u32>, ApiError> {
        let url = self.url(
            COMPLEX_INFO_PATH,
            &[("kaptCode", kapt_code.to_string()), ("_type", "json".to_string())],
        )?;
        let body = self.get_text("complex_info", url).await?;
        parse_household_count(&body)
    }
}

/// Serves pages from files: `trades/{region}_{YYYYMM}_{page}.xml|json` and
/// `households/{kapt_code}.json`. A missing trade page reads as empty.
#[derive(Debug, Clone)]
pub struct FixturePageSource {
    root: PathBuf,
}

impl FixturePageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_optional(path: &Path) -> Result<Option<String>, ApiError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ApiError::Fixture {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    async fn fetch_trade_page(
        &self,
        region_code: &str,
        period: Period,
        page: u32,
        _page_size: u32,
    ) -> Result<TradePage, ApiError> {
        let stem = format!("{region_code}_{period}_{page}");
        for ext in ["xml", "json"] {
            let path = self.root.join("trades").join(format!("{stem}.{ext}"));
            if let Some(body) = Self::read_optional(&path).await? {
                debug!(path = %path.display(), "serving fixture page");
                return parse_trade_page(&body);
            }
        }
        Ok(TradePage::default())
    }

    async fn fetch_household_count(&self, kapt_code: &str) -> Result<Option<u32>, ApiError> {
        let path = self.root.join("households").join(format!("{kapt_code}.json"));
        match Self::read_optional(&path).await? {
            Some(body) => parse_household_count(&body),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML_PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<response>
  <header><resultCode>000</resultCode><resultMsg>OK</resultMsg></header>
  <body>
    <items>
      <item>
        <aptNm>현대1차</aptNm><dealAmount>   145,000</dealAmount><dealDay>3</dealDay>
        <dealMonth>1</dealMonth><dealYear>2024</dealYear><excluUseAr>84.97</excluUseAr>
        <floor>7</floor><sggCd>11680</sggCd><umdNm>압구정동</umdNm>
      </item>
    </items>
    <numOfRows>10</numOfRows><pageNo>1</pageNo><totalCount>1</totalCount>
  </body>
</response>"#;

    #[test]
    fn parses_single_item_xml_page() {
        let page = parse_trade_page(XML_PAGE).expect("page");
        assert_eq!(page.total_count, 1);
        assert_eq!(page.items.len(), 1);
        let item = &page.items[0];
        assert_eq!(item.get("aptNm").map(String::as_str), Some("현대1차"));
        assert_eq!(item.get("dealAmount").map(String::as_str), Some("145,000"));
    }

    #[test]
    fn non_success_result_code_is_typed_error() {
        let xml = "<response><header><resultCode>03</resultCode><resultMsg>NO_DATA</resultMsg></header></response>";
        match parse_trade_page(xml) {
            Err(ApiError::Upstream { code, message }) => {
                assert_eq!(code, "03");
                assert_eq!(message, "NO_DATA");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[test]
    fn gateway_error_envelope_is_typed_error() {
        let xml = "<OpenAPI_ServiceResponse><cmmMsgHeader><errMsg>SERVICE ERROR</errMsg><returnAuthMsg>SERVICE_KEY_IS_NOT_REGISTERED_ERROR</returnAuthMsg><returnReasonCode>30</returnReasonCode></cmmMsgHeader></OpenAPI_ServiceResponse>";
        match parse_trade_page(xml) {
            Err(ApiError::Upstream { code, message }) => {
                assert_eq!(code, "30");
                assert_eq!(message, "SERVICE_KEY_IS_NOT_REGISTERED_ERROR");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[test]
    fn parses_json_pages_with_object_or_array_items() {
        let single = r#"{"response":{"header":{"resultCode":"00","resultMsg":"OK"},"body":{"items":{"item":{"aptNm":"A","dealYear":2024}},"totalCount":1}}}"#;
        let page = parse_trade_page(single).expect("single");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].get("dealYear").map(String::as_str), Some("2024"));

        let many = r#"{"response":{"header":{"resultCode":"00"},"body":{"items":{"item":[{"aptNm":"A"},{"aptNm":"B"}]},"totalCount":"7"}}}"#;
        let page = parse_trade_page(many).expect("many");
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total_count, 7);

        let empty = r#"{"response":{"header":{"resultCode":"00"},"body":{"items":"","totalCount":0}}}"#;
        assert_eq!(parse_trade_page(empty).expect("empty"), TradePage::default());
    }

    #[test]
    fn household_count_reads_kaptda_cnt() {
        let body = r#"{"response":{"header":{"resultCode":"00"},"body":{"item":{"kaptCode":"A1","kaptdaCnt":"1,152"}}}}"#;
        assert_eq!(parse_household_count(body).expect("count"), Some(1152));
        let missing = r#"{"response":{"body":{"item":{}}}}"#;
        assert_eq!(parse_household_count(missing).expect("count"), None);
    }

    #[test]
    fn urls_carry_query_parameters() {
        let http = HttpFetcher::new(Default::default()).expect("http");
        let client = PublicDataClient::new(http, "https://example.test/1613000/", "k+y/=");
        let url = client
            .url(TRADE_PATH, &[("LAWD_CD", "11110".to_string())])
            .expect("url");
        assert_eq!(url.path(), "/1613000/RTMSDataSvcAptTradeDev/getRTMSDataSvcAptTradeDev");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("serviceKey".to_string(), "k+y/=".to_string()));
        assert_eq!(pairs[1], ("LAWD_CD".to_string(), "11110".to_string()));
    }
}
