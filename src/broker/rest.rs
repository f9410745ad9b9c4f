// HTTP client for an MT5-style terminal gateway
//
// The terminal side exposes a small JSON API; this client maps it onto the
// Broker trait. Every call carries the configured timeout, and transport
// failures come back as tagged errors so a cycle can skip and continue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{
    AccountSnapshot, Broker, BrokerPosition, Candle, OrderFill, OrderRequest, SymbolSpec, Tick,
    Timeframe, TradeDirection,
};
use crate::error::{TradingError, TradingResult};

pub struct RestBridgeBroker {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCandle {
    time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    ticket: u64,
    symbol: String,
    direction: TradeDirection,
    volume: f64,
    entry_price: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    open_time: DateTime<Utc>,
    #[serde(default)]
    strategy_tag: String,
    #[serde(default)]
    unrealized_pnl: f64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    success: bool,
    ticket: Option<u64>,
    executed_price: Option<f64>,
    executed_volume: Option<f64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    success: bool,
    error: Option<String>,
}

impl RestBridgeBroker {
    pub fn new(base_url: &str, api_token: Option<String>, timeout: Duration) -> TradingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TradingError::Internal(format!("http client build failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> TradingResult<T> {
        let response = self.get(path).send().await?.error_for_status()?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl Broker for RestBridgeBroker {
    async fn account_info(&self) -> TradingResult<AccountSnapshot> {
        self.fetch_json("/account").await
    }

    async fn symbol_spec(&self, symbol: &str) -> TradingResult<SymbolSpec> {
        self.fetch_json(&format!("/symbols/{}", symbol)).await
    }

    async fn positions(&self) -> TradingResult<Vec<BrokerPosition>> {
        let wire: Vec<WirePosition> = self.fetch_json("/positions").await?;
        Ok(wire
            .into_iter()
            .map(|p| BrokerPosition {
                ticket: p.ticket,
                symbol: p.symbol,
                direction: p.direction,
                volume: p.volume,
                entry_price: p.entry_price,
                stop_loss: p.stop_loss.filter(|sl| *sl > 0.0),
                take_profit: p.take_profit.filter(|tp| *tp > 0.0),
                open_time: p.open_time,
                strategy_tag: p.strategy_tag,
                unrealized_pnl: p.unrealized_pnl,
            })
            .collect())
    }

    async fn rates(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> TradingResult<Vec<Candle>> {
        let path = format!(
            "/rates?symbol={}&timeframe={}&count={}",
            symbol, timeframe, count
        );
        let wire: Vec<WireCandle> = self.fetch_json(&path).await?;
        if wire.is_empty() {
            return Err(TradingError::data_unavailable(symbol, "empty rate history"));
        }
        Ok(wire
            .into_iter()
            .map(|c| Candle {
                time: c.time,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
            })
            .collect())
    }

    async fn tick(&self, symbol: &str) -> TradingResult<Tick> {
        self.fetch_json(&format!("/tick/{}", symbol)).await
    }

    async fn send_order(&self, request: &OrderRequest) -> TradingResult<OrderFill> {
        let mut builder = self
            .client
            .post(format!("{}/orders", self.base_url))
            .json(request);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response: OrderResponse = builder.send().await?.error_for_status()?.json().await?;

        if !response.success {
            return Err(TradingError::BrokerRejection(
                response.error.unwrap_or_else(|| "unspecified rejection".to_string()),
            ));
        }

        match (response.ticket, response.executed_price) {
            (Some(ticket), Some(executed_price)) => Ok(OrderFill {
                ticket,
                executed_price,
                executed_volume: response.executed_volume.unwrap_or(request.volume),
            }),
            _ => Err(TradingError::BrokerRejection(
                "fill acknowledged without ticket".to_string(),
            )),
        }
    }

    async fn modify_position(
        &self,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> TradingResult<()> {
        let mut builder = self
            .client
            .patch(format!("{}/positions/{}", self.base_url, ticket))
            .json(&serde_json::json!({
                "stop_loss": stop_loss,
                "take_profit": take_profit,
            }));
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response: AckResponse = builder.send().await?.error_for_status()?.json().await?;
        if !response.success {
            return Err(TradingError::BrokerRejection(
                response.error.unwrap_or_else(|| "modify rejected".to_string()),
            ));
        }
        Ok(())
    }

    async fn close_position(&self, ticket: u64) -> TradingResult<()> {
        let mut builder = self
            .client
            .delete(format!("{}/positions/{}", self.base_url, ticket));
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response: AckResponse = builder.send().await?.error_for_status()?.json().await?;
        if !response.success {
            return Err(TradingError::BrokerRejection(
                response.error.unwrap_or_else(|| "close rejected".to_string()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn broker_for(server: &mockito::ServerGuard) -> RestBridgeBroker {
        RestBridgeBroker::new(&server.url(), None, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_account_info() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/account")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"balance": 10000.0, "equity": 9850.5, "margin": 120.0, "free_margin": 9730.5}"#)
            .create_async()
            .await;

        let account = broker_for(&server).account_info().await.unwrap();
        assert!((account.equity - 9850.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_order_rejection_is_tagged() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/orders")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success": false, "error": "not enough money"}"#)
            .create_async()
            .await;

        let request = OrderRequest {
            client_id: Uuid::new_v4(),
            symbol: "EURUSD".to_string(),
            direction: TradeDirection::Long,
            volume: 0.2,
            entry_price: 1.1,
            stop_loss: 1.095,
            take_profit: 1.11,
            strategy_tag: "swing".to_string(),
            signal_strength: 0.7,
        };

        let err = broker_for(&server).send_order(&request).await.unwrap_err();
        match err {
            TradingError::BrokerRejection(msg) => assert!(msg.contains("not enough money")),
            other => panic!("expected BrokerRejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_maps_to_broker_category() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/account")
            .with_status(500)
            .create_async()
            .await;

        let err = broker_for(&server).account_info().await.unwrap_err();
        assert_eq!(err.category(), "broker");
    }

    #[tokio::test]
    async fn test_empty_rates_fail_closed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/rates")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let err = broker_for(&server)
            .rates("EURUSD", Timeframe::M5, 100)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "data");
    }
}
