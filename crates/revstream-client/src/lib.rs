#![doc = include_str!("../README.md")]

pub mod client;

pub use client::{
    config::ClientConfig,
    connection::SearchClient,
    exchange::{
        CallOutcome, CallRequest, ExchangeParams, Termination, resume_exchange, run_exchange,
        send_first_context,
    },
};
