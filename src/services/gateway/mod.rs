//! Payment gateway integration: REST client, wire types and channel mapping.

pub mod channels;
pub mod client;
pub mod types;

pub use channels::{
    plan_channel, CardDetails, ChannelPlan, EWalletType, PaymentMethodRequest, ReturnUrls,
};
pub use client::GatewayClient;
pub use types::*;
