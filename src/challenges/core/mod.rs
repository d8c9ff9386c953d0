//! Core utilities shared by the challenge flow and the provider adapters.

pub mod reqwest_client;
pub mod transport;

pub use reqwest_client::ReqwestTransport;
pub use transport::{
    HttpTransport, TransportError, TransportResponse, insert_cookie_header, merge_cookies,
};
