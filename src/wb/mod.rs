//! Client for the Wildberries product card API.
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::Upstream;
use crate::model::{price_from_minor, ProductSnapshot};
use crate::wb::model::CardResponse;

pub mod model;

const WB_CARD_API_BASE: &str = "https://card.wb.ru/";
const MAX_ERROR_BODY: usize = 200;

/// Classified failure of a single upstream fetch. The client never retries;
/// the next scheduler tick does.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("product {0} not found upstream")]
    NotFound(String),
    #[error("upstream did not answer in time: {0}")]
    Timeout(String),
    #[error("unexpected upstream response: {0}")]
    Response(String),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::NotFound(_) => "not_found",
            FetchError::Timeout(_) => "timeout",
            FetchError::Response(_) => "response_error",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            FetchError::Timeout(err.to_string())
        } else {
            FetchError::Response(err.to_string())
        }
    }
}

#[async_trait]
pub trait ProductSource: Send + Sync {
    async fn fetch(&self, artikul: &str) -> Result<ProductSnapshot, FetchError>;
}

#[derive(Clone)]
pub struct WbClient {
    http: Client,
    base_url: Url,
    dest: i64,
    spp: i64,
}

impl fmt::Debug for WbClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WbClient")
            .field("base_url", &self.base_url)
            .field("dest", &self.dest)
            .finish_non_exhaustive()
    }
}

impl WbClient {
    pub fn new(dest: i64, spp: i64) -> Result<Self> {
        let base_url = Url::parse(WB_CARD_API_BASE).context("invalid default card API URL")?;
        Self::with_base_url(
            base_url,
            dest,
            spp,
            Duration::from_secs(5),
            Duration::from_secs(10),
        )
    }

    pub fn from_config(cfg: &Upstream) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url)
            .with_context(|| format!("invalid upstream.base_url '{}'", cfg.base_url))?;
        Self::with_base_url(
            base_url,
            cfg.dest,
            cfg.spp,
            Duration::from_secs(cfg.connect_timeout_secs),
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }

    pub fn with_base_url(
        base_url: Url,
        dest: i64,
        spp: i64,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent("wb-pricewatch/0.1")
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .context("failed to build upstream HTTP client")?;
        Ok(Self {
            http,
            base_url,
            dest,
            spp,
        })
    }

    pub fn build_request(&self, artikul: &str) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("cards/v1/detail")
            .context("invalid card API base URL")?;
        let dest = self.dest.to_string();
        let spp = self.spp.to_string();
        self.http
            .get(endpoint)
            .query(&[
                ("appType", "1"),
                ("curr", "rub"),
                ("dest", dest.as_str()),
                ("spp", spp.as_str()),
                ("nm", artikul),
            ])
            .build()
            .context("failed to build card request")
    }
}

#[async_trait]
impl ProductSource for WbClient {
    async fn fetch(&self, artikul: &str) -> Result<ProductSnapshot, FetchError> {
        let request = self
            .build_request(artikul)
            .map_err(|err| FetchError::Response(format!("{:#}", err)))?;
        debug!(url=%request.url(), "requesting product card");
        let res = self.http.execute(request).await?;
        let status = res.status();
        let body = res.text().await?;
        parse_card_response(artikul, status, &body)
    }
}

/// Turn a raw card API answer into a snapshot, classifying every failure.
pub fn parse_card_response(
    artikul: &str,
    status: StatusCode,
    body: &str,
) -> Result<ProductSnapshot, FetchError> {
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound(artikul.to_string()));
    }
    if !status.is_success() {
        return Err(FetchError::Response(format!(
            "HTTP {}: {}",
            status,
            truncate(body, MAX_ERROR_BODY)
        )));
    }

    let payload: CardResponse = serde_json::from_str(body)
        .map_err(|err| FetchError::Response(format!("invalid JSON: {}", err)))?;
    let data = payload
        .data
        .ok_or_else(|| FetchError::Response("missing `data` object".into()))?;
    let Some(product) = data.products.into_iter().next() else {
        return Err(FetchError::NotFound(artikul.to_string()));
    };

    let name = product
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| FetchError::Response("missing product name".into()))?;
    let price_minor = product
        .sale_price_u
        .ok_or_else(|| FetchError::Response("missing salePriceU".into()))?;
    if price_minor < 0 {
        return Err(FetchError::Response(format!(
            "negative salePriceU {}",
            price_minor
        )));
    }
    let rating = product
        .rating
        .or(product.review_rating)
        .unwrap_or(0.0)
        .clamp(0.0, 5.0);
    let quantity = product
        .sizes
        .iter()
        .find_map(|size| size.stocks.first())
        .and_then(|stock| stock.qty)
        .unwrap_or(0)
        .max(0);

    Ok(ProductSnapshot {
        artikul: artikul.to_string(),
        name,
        price: price_from_minor(price_minor),
        rating,
        quantity,
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn card(product: serde_json::Value) -> String {
        json!({ "data": { "products": [product] } }).to_string()
    }

    #[test]
    fn parses_full_card() {
        let body = card(json!({
            "name": "Thermos 1L",
            "salePriceU": 250000,
            "rating": 4.8,
            "sizes": [
                { "stocks": [] },
                { "stocks": [ { "qty": 12 }, { "qty": 3 } ] }
            ]
        }));
        let snap = parse_card_response("303265098", StatusCode::OK, &body).unwrap();
        assert_eq!(snap.artikul, "303265098");
        assert_eq!(snap.name, "Thermos 1L");
        assert_eq!(snap.price.to_string(), "2500.00");
        assert_eq!(snap.rating, 4.8);
        assert_eq!(snap.quantity, 12);
    }

    #[test]
    fn absent_rating_and_stock_default_to_zero() {
        let body = card(json!({ "name": "Mug", "salePriceU": 9900 }));
        let snap = parse_card_response("1", StatusCode::OK, &body).unwrap();
        assert_eq!(snap.rating, 0.0);
        assert_eq!(snap.quantity, 0);
        assert_eq!(snap.price.to_string(), "99.00");
    }

    #[test]
    fn empty_product_list_is_not_found() {
        let body = json!({ "data": { "products": [] } }).to_string();
        let err = parse_card_response("1", StatusCode::OK, &body).unwrap_err();
        assert!(matches!(err, FetchError::NotFound(ref a) if a == "1"));
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn http_404_is_not_found() {
        let err = parse_card_response("1", StatusCode::NOT_FOUND, "").unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[test]
    fn server_error_is_response_error() {
        let err =
            parse_card_response("1", StatusCode::BAD_GATEWAY, "upstream down").unwrap_err();
        assert_eq!(err.kind(), "response_error");
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn malformed_json_and_missing_fields_are_response_errors() {
        let err = parse_card_response("1", StatusCode::OK, "<html>").unwrap_err();
        assert!(matches!(err, FetchError::Response(_)));

        let err = parse_card_response("1", StatusCode::OK, "{}").unwrap_err();
        assert!(matches!(err, FetchError::Response(_)));

        let body = card(json!({ "name": "No price" }));
        let err = parse_card_response("1", StatusCode::OK, &body).unwrap_err();
        assert!(err.to_string().contains("salePriceU"));

        let body = card(json!({ "salePriceU": 100 }));
        let err = parse_card_response("1", StatusCode::OK, &body).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn build_request_sets_query() {
        let client = WbClient::new(-1257786, 27).unwrap();
        let request = client.build_request("303265098").unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().host_str(), Some("card.wb.ru"));
        assert_eq!(request.url().path(), "/cards/v1/detail");
        let pairs: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("nm".into(), "303265098".into())));
        assert!(pairs.contains(&("dest".into(), "-1257786".into())));
        assert!(pairs.contains(&("curr".into(), "rub".into())));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("ошибка", 3), "оши");
        assert_eq!(truncate("ok", 10), "ok");
    }

    fn client_for(addr: std::net::SocketAddr) -> WbClient {
        WbClient::with_base_url(
            Url::parse(&format!("http://{}/", addr)).unwrap(),
            -1257786,
            27,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    /// Accept one connection and answer it with a canned HTTP response.
    async fn serve_once(status_line: &'static str, body: &'static str) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            sock.write_all(response.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
        });
        addr
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let err = client_for(addr).fetch("303265098").await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        server.abort();
    }

    #[tokio::test]
    async fn refused_connection_is_a_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client_for(addr).fetch("303265098").await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn server_error_over_the_wire_is_a_response_error() {
        let addr = serve_once("500 Internal Server Error", "{\"error\":\"boom\"}").await;
        let err = client_for(addr).fetch("303265098").await.unwrap_err();
        assert_eq!(err.kind(), "response_error");
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn wire_404_and_card_are_classified() {
        let addr = serve_once("404 Not Found", "").await;
        let err = client_for(addr).fetch("1").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let addr = serve_once(
            "200 OK",
            r#"{"data":{"products":[{"name":"Thermos","salePriceU":250000,"sizes":[{"stocks":[{"qty":4}]}]}]}}"#,
        )
        .await;
        let snapshot = client_for(addr).fetch("303265098").await.unwrap();
        assert_eq!(snapshot.price, price_from_minor(250000));
        assert_eq!(snapshot.quantity, 4);
    }
}
