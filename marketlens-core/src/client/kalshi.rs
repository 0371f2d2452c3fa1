//! Kalshi trade API v2 adapter.
//!
//! Decodes upstream payloads into private wire structs and converts them to
//! validated domain records, so nothing past this module sees raw JSON.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::ControlFlow;
use std::time::Instant;
use tracing::{debug, info};

use super::error::FetchError;
use super::rate_limited::{Paginated, RateLimitedClient};
use super::source::{CandleRequest, MarketDataSource, MarketQuery, SeriesQuery};
use crate::domain::{
    from_epoch_secs, validate_candle_sequence, validate_series_membership,
    validate_unique_tickers, CandleRecord, DataSource, MarketRecord, Price, SeriesRecord,
    ValidationError,
};

const API: &str = "/trade-api/v2";

/// Upstream maximum for `/events`.
const EVENTS_PAGE_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
struct WireMarket {
    ticker: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    event_ticker: String,
    #[serde(default)]
    yes_bid: Option<u32>,
    #[serde(default)]
    yes_ask: Option<u32>,
    #[serde(default)]
    no_bid: Option<u32>,
    #[serde(default)]
    no_ask: Option<u32>,
    #[serde(default)]
    last_price: Option<u32>,
    #[serde(default)]
    yes_bid_dollars: Option<String>,
    #[serde(default)]
    yes_ask_dollars: Option<String>,
    #[serde(default)]
    no_bid_dollars: Option<String>,
    #[serde(default)]
    no_ask_dollars: Option<String>,
    #[serde(default)]
    last_price_dollars: Option<String>,
    #[serde(default)]
    volume: u64,
    #[serde(default)]
    volume_24h: u64,
    #[serde(default)]
    open_interest: u64,
    open_time: DateTime<Utc>,
    close_time: DateTime<Utc>,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct MarketsPage {
    #[serde(default)]
    markets: Vec<WireMarket>,
    #[serde(default)]
    cursor: Option<String>,
}

impl Paginated for MarketsPage {
    type Item = WireMarket;
    fn into_parts(self) -> (Vec<WireMarket>, Option<String>) {
        (self.markets, self.cursor)
    }
}

#[derive(Debug, Deserialize)]
struct MarketDetail {
    market: WireMarket,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    event_ticker: String,
    #[serde(default)]
    series_ticker: String,
    #[serde(default)]
    markets: Vec<WireEventMarket>,
}

/// Nested markets only need the ticker; their other fields vary by endpoint.
#[derive(Debug, Deserialize)]
struct WireEventMarket {
    ticker: String,
}

#[derive(Debug, Deserialize)]
struct EventsPage {
    #[serde(default)]
    events: Vec<WireEvent>,
    #[serde(default)]
    cursor: Option<String>,
}

impl Paginated for EventsPage {
    type Item = WireEvent;
    fn into_parts(self) -> (Vec<WireEvent>, Option<String>) {
        (self.events, self.cursor)
    }
}

#[derive(Debug, Deserialize)]
struct EventDetail {
    event: WireEvent,
}

#[derive(Debug, Deserialize)]
struct WireSeries {
    ticker: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    category: String,
}

#[derive(Debug, Deserialize)]
struct SeriesList {
    #[serde(default)]
    series: Option<Vec<WireSeries>>,
}

#[derive(Debug, Default, Deserialize)]
struct WireOhlc {
    #[serde(default)]
    open: Option<u32>,
    #[serde(default)]
    high: Option<u32>,
    #[serde(default)]
    low: Option<u32>,
    #[serde(default)]
    close: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireCandle {
    end_period_ts: i64,
    #[serde(default)]
    price: WireOhlc,
    #[serde(default)]
    volume: u64,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    #[serde(default)]
    candlesticks: Vec<WireCandle>,
}

fn price_field(cents: Option<u32>, dollars: Option<&str>) -> Result<Option<Price>, ValidationError> {
    match (cents, dollars) {
        (Some(c), _) => Price::from_cents(c).map(Some),
        (None, Some(d)) => Price::from_dollars_str(d).map(Some),
        (None, None) => Ok(None),
    }
}

fn cents_opt(cents: Option<u32>) -> Result<Option<Price>, ValidationError> {
    cents.map(Price::from_cents).transpose()
}

impl WireMarket {
    fn into_record(self, series_ticker: Option<String>) -> Result<MarketRecord, ValidationError> {
        let record = MarketRecord {
            yes_bid: price_field(self.yes_bid, self.yes_bid_dollars.as_deref())?,
            yes_ask: price_field(self.yes_ask, self.yes_ask_dollars.as_deref())?,
            no_bid: price_field(self.no_bid, self.no_bid_dollars.as_deref())?,
            no_ask: price_field(self.no_ask, self.no_ask_dollars.as_deref())?,
            last_price: price_field(self.last_price, self.last_price_dollars.as_deref())?,
            status: self.status.parse()?,
            ticker: self.ticker,
            title: self.title,
            event_ticker: self.event_ticker,
            series_ticker,
            volume: self.volume,
            volume_24h: self.volume_24h,
            open_interest: self.open_interest,
            open_time: self.open_time,
            close_time: self.close_time,
            source: DataSource::Kalshi,
        };
        record.validate()?;
        Ok(record)
    }
}

fn param(k: &str, v: impl ToString) -> (String, String) {
    (k.to_string(), v.to_string())
}

/// Percent-encode one URL path segment; RFC 3986 unreserved bytes pass.
fn segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Kalshi trade API v2 over a [`RateLimitedClient`].
pub struct KalshiApi {
    client: RateLimitedClient,
}

impl KalshiApi {
    pub fn new(client: RateLimitedClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &RateLimitedClient {
        &self.client
    }

    /// Map event tickers to series tickers, stopping once all are found.
    fn resolve_event_series(
        &self,
        needed: &HashSet<String>,
        deadline: Instant,
    ) -> Result<HashMap<String, String>, FetchError> {
        let mut found: HashMap<String, String> = HashMap::with_capacity(needed.len());
        if needed.is_empty() {
            return Ok(found);
        }
        let query = [param("limit", EVENTS_PAGE_LIMIT)];
        self.client.for_each_page::<EventsPage, _>(
            &format!("{API}/events"),
            &query,
            deadline,
            |events| {
                for e in events {
                    if needed.contains(&e.event_ticker) && !e.series_ticker.is_empty() {
                        found.insert(e.event_ticker, e.series_ticker);
                    }
                }
                Ok(if found.len() >= needed.len() {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            },
        )?;
        debug!(needed = needed.len(), found = found.len(), "event → series mapping");
        Ok(found)
    }

    /// Series for one market, via market → event.
    fn series_for_market(&self, ticker: &str, deadline: Instant) -> Result<String, FetchError> {
        let market: MarketDetail =
            self.client
                .get_json_until(&format!("{API}/markets/{}", segment(ticker)), &[], deadline)?;
        if market.market.event_ticker.is_empty() {
            return Err(FetchError::Malformed(format!("market {ticker} has no event")));
        }
        let event: EventDetail = self.client.get_json_until(
            &format!("{API}/events/{}", segment(&market.market.event_ticker)),
            &[],
            deadline,
        )?;
        if event.event.series_ticker.is_empty() {
            return Err(FetchError::Malformed(format!(
                "event {} has no series",
                event.event.event_ticker
            )));
        }
        Ok(event.event.series_ticker)
    }
}

impl MarketDataSource for KalshiApi {
    fn name(&self) -> &str {
        "kalshi"
    }

    fn fetch_markets(&self, query: &MarketQuery) -> Result<Vec<MarketRecord>, FetchError> {
        let deadline = self.client.deadline_within(query.budget);
        let mut params = Vec::new();
        if let Some(s) = &query.status {
            params.push(param("status", s));
        }
        if let Some(s) = &query.series_ticker {
            params.push(param("series_ticker", s));
        }
        let wire = self
            .client
            .fetch_all_pages::<MarketsPage>(&format!("{API}/markets"), &params, deadline)?;
        let fetched = wire.len();

        // Cursor pages can shift while walking; a ticker seen twice keeps
        // its latest version at the first position.
        let mut order: Vec<WireMarket> = Vec::with_capacity(wire.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(wire.len());
        for m in wire.into_iter().filter(|m| m.volume_24h >= query.min_volume) {
            match index.get(&m.ticker) {
                Some(&i) => order[i] = m,
                None => {
                    index.insert(m.ticker.clone(), order.len());
                    order.push(m);
                }
            }
        }

        let series_of = if query.series_ticker.is_none() && query.enrich_series {
            let needed: HashSet<String> = order
                .iter()
                .filter(|m| !m.event_ticker.is_empty())
                .map(|m| m.event_ticker.clone())
                .collect();
            self.resolve_event_series(&needed, deadline)?
        } else {
            HashMap::new()
        };

        let records = order
            .into_iter()
            .map(|m| {
                let series = query
                    .series_ticker
                    .clone()
                    .or_else(|| series_of.get(&m.event_ticker).cloned());
                m.into_record(series)
            })
            .collect::<Result<Vec<_>, _>>()?;
        validate_unique_tickers(&records)?;
        info!(fetched, kept = records.len(), min_volume = query.min_volume, "markets fetched");
        Ok(records)
    }

    fn fetch_series(&self, query: &SeriesQuery) -> Result<Vec<SeriesRecord>, FetchError> {
        let deadline = self.client.deadline_within(query.budget);
        let mut params = Vec::new();
        if let Some(c) = &query.category {
            params.push(param("category", c));
        }
        let list: SeriesList =
            self.client
                .get_json_until(&format!("{API}/series"), &params, deadline)?;
        let mut by_ticker: BTreeMap<String, SeriesRecord> = BTreeMap::new();
        for s in list.series.unwrap_or_default() {
            if s.ticker.trim().is_empty() {
                return Err(ValidationError::EmptyTicker.into());
            }
            by_ticker.insert(s.ticker.clone(), SeriesRecord::new(s.ticker, s.title, s.category));
        }

        if query.with_members && !by_ticker.is_empty() {
            let q = [
                param("limit", EVENTS_PAGE_LIMIT),
                param("with_nested_markets", "true"),
            ];
            self.client.for_each_page::<EventsPage, _>(
                &format!("{API}/events"),
                &q,
                deadline,
                |events| {
                    for e in events {
                        if let Some(series) = by_ticker.get_mut(&e.series_ticker) {
                            series.members.extend(e.markets.into_iter().map(|m| m.ticker));
                        }
                    }
                    Ok(ControlFlow::Continue(()))
                },
            )?;
        }

        let records: Vec<SeriesRecord> = by_ticker.into_values().collect();
        validate_series_membership(&records)?;
        info!(series = records.len(), "series fetched");
        Ok(records)
    }

    fn fetch_candles(&self, request: &CandleRequest) -> Result<Vec<CandleRecord>, FetchError> {
        let deadline = self.client.deadline_within(request.budget);
        let series = match &request.series_ticker {
            Some(s) => s.clone(),
            None => self.series_for_market(&request.ticker, deadline)?,
        };
        let period = request.granularity.period_secs();
        let path = format!(
            "{API}/series/{}/markets/{}/candlesticks",
            segment(&series),
            segment(&request.ticker)
        );
        let params = [param("period_interval", request.granularity.period_minutes())];
        let ticker = request.ticker.clone();
        let granularity = request.granularity;

        let candles = self.client.fetch_chunked(
            &path,
            &params,
            request.start.timestamp(),
            request.end.timestamp(),
            period,
            deadline,
            |resp: CandlesResponse| {
                resp.candlesticks
                    .into_iter()
                    .map(|c| {
                        Ok(CandleRecord {
                            ticker: ticker.clone(),
                            start: from_epoch_secs(c.end_period_ts - period)?,
                            open: cents_opt(c.price.open)?,
                            high: cents_opt(c.price.high)?,
                            low: cents_opt(c.price.low)?,
                            close: cents_opt(c.price.close)?,
                            volume: c.volume,
                            granularity,
                        })
                    })
                    .collect::<Result<Vec<_>, ValidationError>>()
                    .map_err(FetchError::from)
            },
            |c: &CandleRecord| c.start.timestamp(),
        )?;
        validate_candle_sequence(&candles)?;
        debug!(ticker = %request.ticker, %granularity, count = candles.len(), "candles fetched");
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::auth::Credentials;
    use crate::client::error::TransportError;
    use crate::client::transport::{HttpResponse, Transport};
    use crate::config::ClientConfig;
    use crate::domain::{Granularity, MarketStatus};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    /// Routes by path prefix; each route replays its own queue.
    #[derive(Default)]
    struct Routes {
        routes: Mutex<Vec<(String, VecDeque<String>)>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Routes {
        fn on(self, prefix: &str, bodies: &[&str]) -> Self {
            self.routes.lock().push((
                prefix.to_string(),
                bodies.iter().map(|b| b.to_string()).collect(),
            ));
            self
        }
    }

    impl Transport for Routes {
        fn get(
            &self,
            path: &str,
            _query: &[(String, String)],
            _headers: &[(String, String)],
            _timeout: Duration,
        ) -> Result<HttpResponse, TransportError> {
            self.log.lock().push(path.to_string());
            let mut routes = self.routes.lock();
            let route = routes
                .iter_mut()
                .filter(|(p, _)| path.starts_with(p.as_str()))
                .max_by_key(|(p, _)| p.len());
            match route {
                Some((_, q)) if !q.is_empty() => Ok(HttpResponse::ok(q.pop_front().unwrap())),
                _ => Ok(HttpResponse::status(404)),
            }
        }
    }

    fn api(routes: Routes) -> KalshiApi {
        let config = ClientConfig {
            requests_per_second: 0.0,
            max_retries: 0,
            ..ClientConfig::default()
        };
        KalshiApi::new(RateLimitedClient::with_transport(
            &config,
            Credentials::Anonymous,
            Box::new(routes),
        ))
    }

    fn market_json(ticker: &str, event: &str, vol24: u64) -> String {
        format!(
            r#"{{"ticker":"{ticker}","title":"t","event_ticker":"{event}","yes_bid":40,"yes_ask":42,
               "last_price_dollars":"0.41","volume":10,"volume_24h":{vol24},"open_interest":3,
               "open_time":"2024-11-01T00:00:00Z","close_time":"2024-12-01T00:00:00Z","status":"active"}}"#
        )
    }

    #[test]
    fn markets_are_filtered_and_enriched() {
        let page1 = format!(
            r#"{{"markets":[{},{}],"cursor":"c1"}}"#,
            market_json("A", "EV1", 5000),
            market_json("B", "EV2", 10)
        );
        let page2 = format!(r#"{{"markets":[{}],"cursor":""}}"#, market_json("C", "EV2", 2000));
        let events = r#"{"events":[{"event_ticker":"EV1","series_ticker":"S1"},
                                   {"event_ticker":"EV2","series_ticker":"S2"}],"cursor":"more"}"#;
        let routes = Routes::default()
            .on("/trade-api/v2/markets", &[&page1, &page2])
            .on("/trade-api/v2/events", &[events]);
        let records = api(routes)
            .fetch_markets(&MarketQuery {
                min_volume: 1000,
                enrich_series: true,
                ..MarketQuery::default()
            })
            .unwrap();

        let tickers: Vec<_> = records.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["A", "C"]);
        assert_eq!(records[0].series_ticker.as_deref(), Some("S1"));
        assert_eq!(records[1].series_ticker.as_deref(), Some("S2"));
        assert_eq!(records[0].status, MarketStatus::Open);
        assert_eq!(records[0].last_price.unwrap().ticks(), 4100);
    }

    #[test]
    fn out_of_range_price_is_malformed() {
        let bad = market_json("A", "EV1", 5000).replace(r#""yes_bid":40"#, r#""yes_bid":140"#);
        let routes = Routes::default().on(
            "/trade-api/v2/markets",
            &[&format!(r#"{{"markets":[{bad}],"cursor":null}}"#)],
        );
        assert!(matches!(
            api(routes).fetch_markets(&MarketQuery::default()),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn series_membership_from_nested_events() {
        let series = r#"{"series":[{"ticker":"S1","title":"One","category":"Economics"},
                                   {"ticker":"S2","title":"Two","category":"Economics"}]}"#;
        let events = r#"{"events":[{"event_ticker":"E1","series_ticker":"S1","markets":[{"ticker":"M1"},{"ticker":"M2"}]},
                                   {"event_ticker":"E2","series_ticker":"S2","markets":[{"ticker":"M3"}]},
                                   {"event_ticker":"E3","series_ticker":"SX","markets":[{"ticker":"M9"}]}]}"#;
        let routes = Routes::default()
            .on("/trade-api/v2/series", &[series])
            .on("/trade-api/v2/events", &[events]);
        let out = api(routes)
            .fetch_series(&SeriesQuery {
                category: Some("Economics".into()),
                with_members: true,
                ..SeriesQuery::default()
            })
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].members.len(), 2);
        assert!(out[1].members.contains("M3"));
    }

    #[test]
    fn candles_resolve_series_and_convert() {
        let start = from_epoch_secs(1_700_000_000 - 1_700_000_000 % 3600).unwrap();
        let s = start.timestamp();
        let body = format!(
            r#"{{"candlesticks":[
                {{"end_period_ts":{e1},"price":{{"open":40,"high":45,"low":39,"close":44}},"volume":12}},
                {{"end_period_ts":{e2},"price":{{}},"volume":0}}]}}"#,
            e1 = s + 3600,
            e2 = s + 7200
        );
        let routes = Routes::default()
            .on("/trade-api/v2/markets/TICK1", &[&format!(r#"{{"market":{}}}"#, market_json("TICK1", "EV1", 1))])
            .on("/trade-api/v2/events/EV1", &[r#"{"event":{"event_ticker":"EV1","series_ticker":"S1"}}"#])
            .on("/trade-api/v2/series/S1/markets/TICK1/candlesticks", &[&body]);
        let candles = api(routes)
            .fetch_candles(&CandleRequest {
                ticker: "TICK1".into(),
                series_ticker: None,
                granularity: Granularity::Hour,
                start,
                end: start + chrono::Duration::hours(2),
                budget: None,
            })
            .unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].start, start);
        assert_eq!(candles[0].high.unwrap().ticks(), 4500);
        assert!(candles[1].is_empty_interval());
    }

    #[test]
    fn path_segments_are_percent_encoded() {
        assert_eq!(segment("KXHIGHNY-24DEC01-B45.5"), "KXHIGHNY-24DEC01-B45.5");
        assert_eq!(segment("A/B C?"), "A%2FB%20C%3F");

        let routes = Routes::default();
        let log = Arc::clone(&routes.log);
        let request = CandleRequest {
            ticker: "ODD/TICKER#1".into(),
            series_ticker: None,
            granularity: Granularity::Hour,
            start: from_epoch_secs(1_700_000_000).unwrap(),
            end: from_epoch_secs(1_700_003_600).unwrap(),
            budget: None,
        };
        assert!(api(routes).fetch_candles(&request).is_err());
        assert_eq!(*log.lock(), ["/trade-api/v2/markets/ODD%2FTICKER%231"]);
    }
}
