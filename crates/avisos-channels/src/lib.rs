//! # Avisos Channels
//!
//! Messaging provider integrations. The engine only sees the
//! [`DispatchClient`](avisos_core::DispatchClient) and
//! [`TemplateCatalog`](avisos_core::TemplateCatalog) traits; this crate
//! supplies the WhatsApp Business Cloud API implementation of both.

pub mod whatsapp;

pub use whatsapp::WhatsAppChannel;
