//! Platform adapters. Each one implements `MessagingGateway` and turns platform events into
//! `InboundEvent`s.

pub mod kook;
