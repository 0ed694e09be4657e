use log::debug;

use super::{BoxedStream, PacketConn};
use crate::error::DialError;
use crate::metadata::Metadata;

/// 拒绝所有连接
#[derive(Debug)]
pub struct Reject {
    name: String,
}

impl Reject {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn dial(&self, metadata: &Metadata) -> Result<BoxedStream, DialError> {
        debug!("REJECT {}", metadata);
        Err(DialError::Rejected)
    }

    pub async fn dial_packet(&self, metadata: &Metadata) -> Result<Box<dyn PacketConn>, DialError> {
        debug!("REJECT {} ({})", metadata, metadata.network);
        Err(DialError::Rejected)
    }
}
