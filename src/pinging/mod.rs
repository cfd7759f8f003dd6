pub mod cursor;
pub mod error;
pub mod mc_modern;
pub mod mc_query;
pub mod transport;

use std::{net::SocketAddr, time::Duration};

use serde::Serializer;

pub trait Pinger {

    /// The data returned from a ping.
    type Data;

    /// A reported error value.
    type Error: std::error::Error;

    fn ping(&self, addr: SocketAddr) -> std::result::Result<Self::Data, Self::Error>;
}

pub(crate) fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
