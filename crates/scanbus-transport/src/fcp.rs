//! Function Control Protocol request/response transactions
//!
//! A command frame is written to the target's [`FCP_COMMAND`] register; the
//! target answers by writing a frame into our [`FCP_RESPONSE`] register. How
//! those inbound frames reach us depends on the bus driver, so they come
//! from an [`FcpResponder`].

use std::collections::VecDeque;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::csr::{node_address, CSR_REGISTER_BASE, FCP_COMMAND, FCP_RESPONSE};
use crate::transport::{BusTransport, TransportError};

/// Default number of extra send attempts after the first
pub const DEFAULT_SEND_RETRIES: u32 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FcpError {
    #[error("Sending FCP command failed after {attempts} attempts: {source}")]
    SendFailed {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("No FCP response from node {node:#06x}")]
    NoResponse { node: u16 },
    #[error("Empty FCP command frame")]
    EmptyCommand,
}

/// Source of FCP response frames written to the local node
pub trait FcpResponder {

    /// The next frame received from `node`, oldest first
    fn next_response(&mut self, node: u16) -> Option<Vec<u8>>;
}

/// Queued frames, answered in order regardless of sender
impl FcpResponder for VecDeque<Vec<u8>> {
    fn next_response(&mut self, _node: u16) -> Option<Vec<u8>> {
        self.pop_front()
    }
}

/// Response code carried in bits 24-27 of the first response quadlet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponseCode {
    NotImplemented,
    Accepted,
    Rejected,
    InTransition,
    ImplementedStable,
    Changed,
    Interim,
    Other(u8),
}

impl ResponseCode {
    pub fn from_quadlet(quadlet: u32) -> Self {
        match ((quadlet >> 24) & 0xF) as u8 {
            0x8 => Self::NotImplemented,
            0x9 => Self::Accepted,
            0xA => Self::Rejected,
            0xB => Self::InTransition,
            0xC => Self::ImplementedStable,
            0xD => Self::Changed,
            0xF => Self::Interim,
            code => Self::Other(code),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::NotImplemented => "NOT IMPLEMENTED",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::InTransition => "IN TRANSITION",
            Self::ImplementedStable => "IMPLEMENTED / STABLE",
            Self::Changed => "CHANGED",
            Self::Interim => "INTERIM",
            Self::Other(_) => "huh?",
        }
    }
}

/// Final response of an FCP transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcpResponse {
    pub quadlets: Vec<u32>,
}

impl FcpResponse {
    fn from_bytes(bytes: &[u8]) -> Self {
        let quadlets = bytes
            .chunks(4)
            .map(|chunk| {
                let mut q = [0u8; 4];
                q[..chunk.len()].copy_from_slice(chunk);
                u32::from_be_bytes(q)
            })
            .collect();
        Self { quadlets }
    }

    pub fn code(&self) -> ResponseCode {
        self.quadlets
            .first()
            .map(|&q| ResponseCode::from_quadlet(q))
            .unwrap_or(ResponseCode::Other(0))
    }
}

/// Send `command` to the node with `phy_id` and wait for its final response
///
/// The frame is sent up to `1 + send_retries` times while the write itself
/// fails. INTERIM responses are skipped.
pub fn fcp_transaction<T, R>(
    transport: &mut T,
    responder: &mut R,
    phy_id: u8,
    command: &[u32],
    send_retries: u32,
) -> Result<FcpResponse, FcpError>
where
    T: BusTransport + ?Sized,
    R: FcpResponder + ?Sized,
{
    if command.is_empty() {
        return Err(FcpError::EmptyCommand);
    }

    let node = node_address(phy_id);
    let attempts = send_retries + 1;
    let frame: Vec<u8> = command.iter().flat_map(|q| q.to_be_bytes()).collect();

    let mut attempt = 1;
    loop {
        trace!(phy_id, attempt, frame = %hex::encode(&frame), "Sending FCP command");
        match transport.write_quadlets(node, CSR_REGISTER_BASE + FCP_COMMAND, command) {
            Ok(()) => break,
            Err(e) if attempt < attempts => {
                warn!(phy_id, attempt, error = %e, "FCP command not accepted, resending");
                attempt += 1;
            }
            Err(source) => return Err(FcpError::SendFailed { attempts, source }),
        }
    }

    loop {
        let bytes = responder
            .next_response(node)
            .ok_or(FcpError::NoResponse { node })?;
        let response = FcpResponse::from_bytes(&bytes);
        let code = response.code();

        if code == ResponseCode::Interim {
            trace!(phy_id, "INTERIM response, waiting for final response");
            continue;
        }

        debug!(
            phy_id,
            register = %format_args!("{:#014x}", CSR_REGISTER_BASE + FCP_RESPONSE),
            response = code.label(),
            frame = %hex::encode(&bytes),
            "FCP response"
        );
        return Ok(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackBus;

    const PLAY: u32 = 0x0020_C375;

    #[test]
    fn test_response_codes() {
        assert_eq!(ResponseCode::from_quadlet(0x0920_C375), ResponseCode::Accepted);
        assert_eq!(ResponseCode::from_quadlet(0x0C00_0000).label(), "IMPLEMENTED / STABLE");
        assert_eq!(ResponseCode::from_quadlet(0x0F00_0000), ResponseCode::Interim);
        assert_eq!(ResponseCode::from_quadlet(0x0100_0000), ResponseCode::Other(1));
    }

    #[test]
    fn test_transaction_writes_command_register() {
        let mut bus = LoopbackBus::new(node_address(0));
        bus.add_node(node_address(2));
        let mut responses: VecDeque<Vec<u8>> = VecDeque::from(vec![0x0920_C375u32.to_be_bytes().to_vec()]);

        let response = fcp_transaction(&mut bus, &mut responses, 2, &[PLAY], 0).unwrap();
        assert_eq!(response.code(), ResponseCode::Accepted);
        assert_eq!(
            bus.peek(node_address(2), CSR_REGISTER_BASE + FCP_COMMAND, 4),
            Some(PLAY.to_be_bytes().to_vec())
        );
    }

    #[test]
    fn test_interim_responses_are_skipped() {
        let mut bus = LoopbackBus::new(node_address(0));
        bus.add_node(node_address(2));
        let mut responses: VecDeque<Vec<u8>> = VecDeque::from(vec![
            0x0F20_C375u32.to_be_bytes().to_vec(),
            0x0F20_C375u32.to_be_bytes().to_vec(),
            [0x0D20_C375u32.to_be_bytes(), 0x1122_3344u32.to_be_bytes()].concat(),
        ]);

        let response = fcp_transaction(&mut bus, &mut responses, 2, &[PLAY], 0).unwrap();
        assert_eq!(response.code(), ResponseCode::Changed);
        assert_eq!(response.quadlets, vec![0x0D20_C375, 0x1122_3344]);
        assert!(responses.is_empty());
    }

    #[test]
    fn test_only_interim_means_no_response() {
        let mut bus = LoopbackBus::new(node_address(0));
        bus.add_node(node_address(2));
        let mut responses: VecDeque<Vec<u8>> =
            VecDeque::from(vec![0x0F00_0000u32.to_be_bytes().to_vec()]);

        assert_eq!(
            fcp_transaction(&mut bus, &mut responses, 2, &[PLAY], 0),
            Err(FcpError::NoResponse { node: 0xffc2 })
        );
    }

    #[test]
    fn test_send_retries() {
        let mut bus = LoopbackBus::new(node_address(0));
        bus.add_node(node_address(2));
        bus.inject_busy(2);
        let mut responses: VecDeque<Vec<u8>> =
            VecDeque::from(vec![0x0900_0000u32.to_be_bytes().to_vec()]);

        assert!(fcp_transaction(&mut bus, &mut responses, 2, &[PLAY], 2).is_ok());
        assert_eq!(bus.transaction_count(), 3);

        bus.disconnect(node_address(2));
        let err = fcp_transaction(&mut bus, &mut responses, 2, &[PLAY], 1).unwrap_err();
        assert!(matches!(err, FcpError::SendFailed { attempts: 2, .. }));
    }

    #[test]
    fn test_empty_command() {
        let mut bus = LoopbackBus::new(node_address(0));
        let mut responses: VecDeque<Vec<u8>> = VecDeque::new();
        assert_eq!(
            fcp_transaction(&mut bus, &mut responses, 2, &[], 0),
            Err(FcpError::EmptyCommand)
        );
    }
}
