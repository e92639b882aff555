pub mod account;
pub mod adapter;
pub mod catalog;
pub mod crypto;
pub mod dingtalk;
pub mod envelope;
pub mod error;
pub mod feishu;
pub mod onebot;
pub mod outbound;
pub mod qqbot;
pub mod registry;
pub mod service;
pub mod target;
pub mod token;
pub mod types;
pub mod webhook;
pub mod wecom;

pub use adapter::ChannelPlugin;
pub use error::ChannelError;
pub use registry::{build_default_registry, ChannelRegistry};
pub use service::{build_webhook_dispatcher, ChannelService, ForwardSink};
pub use token::TokenCache;
pub use types::{CanonicalMessage, ChannelEvent, OutboundPayload, SendResult};
pub use webhook::{InboundSink, WebhookDispatcher, WebhookRequest, WebhookResponse};
