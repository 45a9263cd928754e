//! Message backbone for the Conductor engine.
//!
//! Agents talk over named channels derived from a message's destination:
//! `role:<role>` for unicast, `broadcast`, `multicast` and `reply:<id>` for
//! request/response. Subscribers register glob patterns (`role:*`) and
//! receive matching messages on spawned tasks.
//!
//! # Main types
//!
//! - [`MessageBus`] — Publish, subscribe, request/response and history.
//! - [`ChannelPattern`] — Compiled segment-aware glob.
//! - [`MessageHandler`] — Async handler trait for pattern registrations.
//! - [`HistoryFilter`] — Query over recent messages.

/// The bus itself.
pub mod bus;
/// Bus configuration.
pub mod config;
/// Bounded message history.
pub mod history;
/// Channel glob patterns.
pub mod pattern;

pub use bus::{HandlerId, MessageBus, MessageCallback, MessageHandler, PublishReceipt, SubscriptionId};
pub use config::BusConfig;
pub use history::HistoryFilter;
pub use pattern::ChannelPattern;
