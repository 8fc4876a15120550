use serde::{Deserialize, Serialize};

/// Venue-level ping frame. The venue expects a JSON text frame, not a
/// WebSocket protocol ping.
pub const PING_FRAME: &str = r#"{"method":"ping"}"#;

/// A channel subscription on the Hyperliquid streaming endpoint.
///
/// Serializes to the venue's wire representation, e.g. `{"type":"allMids"}`
/// or `{"type":"trades","coin":"BTC"}`. `allMids` ticks on every mid-price
/// change and is the recommended heartbeat channel: the stream supervisor
/// declares the link dead when no data arrives within the configured timeout,
/// so at least one naturally-frequent channel should always be subscribed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Subscription {
    AllMids,
    Trades { coin: String },
    L2Book { coin: String },
    Bbo { coin: String },
    Candle { coin: String, interval: String },
    Notification { user: String },
    OrderUpdates { user: String },
}

#[derive(Serialize)]
struct VenueRequest<'a> {
    method: &'a str,
    subscription: &'a Subscription,
}

impl Subscription {
    /// The `{"method":"subscribe",...}` frame for this channel.
    pub fn subscribe_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&VenueRequest {
            method: "subscribe",
            subscription: self,
        })
    }

    /// The `{"method":"unsubscribe",...}` frame for this channel.
    pub fn unsubscribe_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&VenueRequest {
            method: "unsubscribe",
            subscription: self,
        })
    }

    /// Channel label used in logs.
    pub fn channel(&self) -> &'static str {
        match self {
            Subscription::AllMids => "allMids",
            Subscription::Trades { .. } => "trades",
            Subscription::L2Book { .. } => "l2Book",
            Subscription::Bbo { .. } => "bbo",
            Subscription::Candle { .. } => "candle",
            Subscription::Notification { .. } => "notification",
            Subscription::OrderUpdates { .. } => "orderUpdates",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_mids_subscribe_frame() {
        let frame = Subscription::AllMids.subscribe_frame().unwrap();
        assert_eq!(
            frame,
            r#"{"method":"subscribe","subscription":{"type":"allMids"}}"#
        );
    }

    #[test]
    fn test_trades_subscribe_frame_carries_coin() {
        let sub = Subscription::Trades {
            coin: "BTC".to_string(),
        };
        assert_eq!(
            sub.subscribe_frame().unwrap(),
            r#"{"method":"subscribe","subscription":{"type":"trades","coin":"BTC"}}"#
        );
    }

    #[test]
    fn test_l2_book_uses_venue_casing() {
        let sub = Subscription::L2Book {
            coin: "ETH".to_string(),
        };
        assert_eq!(
            sub.subscribe_frame().unwrap(),
            r#"{"method":"subscribe","subscription":{"type":"l2Book","coin":"ETH"}}"#
        );
    }

    #[test]
    fn test_unsubscribe_frame_mirrors_subscribe() {
        let sub = Subscription::Candle {
            coin: "SOL".to_string(),
            interval: "1m".to_string(),
        };
        assert_eq!(
            sub.unsubscribe_frame().unwrap(),
            r#"{"method":"unsubscribe","subscription":{"type":"candle","coin":"SOL","interval":"1m"}}"#
        );
    }

    #[test]
    fn test_ping_frame_is_bare_method() {
        assert_eq!(PING_FRAME, r#"{"method":"ping"}"#);
    }

    #[test]
    fn test_subscription_round_trips_through_json() {
        let sub = Subscription::OrderUpdates {
            user: "0xabc".to_string(),
        };
        let json = serde_json::to_string(&sub).unwrap();
        assert_eq!(json, r#"{"type":"orderUpdates","user":"0xabc"}"#);
        let back: Subscription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sub);
    }

    #[test]
    fn test_channel_labels() {
        assert_eq!(Subscription::AllMids.channel(), "allMids");
        assert_eq!(
            Subscription::Bbo {
                coin: "BTC".into()
            }
            .channel(),
            "bbo"
        );
    }
}
