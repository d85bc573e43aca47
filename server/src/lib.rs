//! Courier Server - authenticated chat backend.
//!
//! This crate provides the server side of Courier, responsible for:
//! - Issuing session tokens for username/password logins, with optional TOTP
//! - Throttling repeated failed logins per username
//! - Processing chat, join and leave events on a bounded worker pool
//! - Delivering chat events through a topic broker to live subscribers
//!
//! # Architecture
//!
//! An inbound [`types::ChatEvent`] goes through two stages. The ingress stage
//! ([`dispatch::ChatDispatcher`]) runs the [`processor::MessageTypeProcessor`]
//! on a [`pool::WorkerPool`] worker and publishes the event to the chat
//! exchange. The egress stage ([`dispatch::EgressConsumer`]) drains the chat
//! queue, persists chat messages idempotently and hands every event to the
//! [`broadcast::ChatBroadcaster`] that WebSocket clients subscribe to.

pub mod broadcast;
pub mod broker;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod login;
pub mod messages;
pub mod middleware;
pub mod pool;
pub mod processor;
pub mod routes;
pub mod secrets;
pub mod store;
pub mod throttle;
pub mod token;
pub mod totp;
pub mod types;
