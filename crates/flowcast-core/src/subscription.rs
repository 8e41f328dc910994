//! Subscription model: which events a connection wants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::events::FlowEvent;

/// A named topic. `flow` is the only one defined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Trade-flow events.
    Flow,
}

impl Channel {
    /// Wire name of the channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flow => "flow",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flow" => Ok(Self::Flow),
            other => Err(ProtocolError::UnknownChannel(other.to_string())),
        }
    }
}

/// A connection's interest: a channel, optionally narrowed to one instrument.
///
/// `coin == None` means every instrument. Two subscriptions are the same
/// entry iff both `channel` and `coin` are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    /// Topic.
    pub channel: Channel,
    /// Instrument filter; `None` is the wildcard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coin: Option<String>,
}

impl Subscription {
    /// Flow subscription with an optional instrument filter.
    ///
    /// An empty coin string is treated as the wildcard.
    pub fn flow(coin: Option<String>) -> Self {
        Self {
            channel: Channel::Flow,
            coin: coin.filter(|c| !c.is_empty()),
        }
    }

    /// Flow subscription for every instrument.
    pub fn all() -> Self {
        Self::flow(None)
    }

    /// Flow subscription for a single instrument.
    pub fn coin(coin: impl Into<String>) -> Self {
        Self::flow(Some(coin.into()))
    }

    /// Whether this is the wildcard entry.
    pub fn is_wildcard(&self) -> bool {
        self.coin.is_none()
    }

    /// Whether an event on `symbol` falls under this subscription.
    pub fn matches_symbol(&self, symbol: &str) -> bool {
        match self.channel {
            Channel::Flow => self.coin.as_deref().is_none_or(|coin| coin == symbol),
        }
    }

    /// Whether `event` falls under this subscription.
    pub fn matches(&self, event: &FlowEvent) -> bool {
        self.matches_symbol(&event.symbol)
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.coin {
            Some(coin) => write!(f, "{}:{coin}", self.channel),
            None => write!(f, "{}:*", self.channel),
        }
    }
}
