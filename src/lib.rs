//! Billing for a retail cycle store: bill entry and totals, PDF invoices,
//! WhatsApp sharing via an uploaded link, dashboard figures, and the
//! install/offline/chat plumbing of the storefront app.

pub mod artifact;
pub mod backend;
pub mod calc;
pub mod chat;
pub mod config;
pub mod dashboard;
pub mod desktop;
pub mod draft;
pub mod error;
pub mod install;
pub mod model;
pub mod offline;
pub mod phone;
pub mod render;
pub mod repository;
pub mod share;
pub mod state_store;
