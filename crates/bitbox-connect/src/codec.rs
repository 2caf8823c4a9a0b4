use prost::Message;
use tracing::debug;

use crate::error::{DeviceError, DeviceResult};
use crate::proto::{
    self, ETH_DATA_CHUNK_SIZE, PROTOCOL_VERSION, RequestEnvelope, ResponseEnvelope,
    request::Kind as Request, response::Kind as Response,
};
use crate::state::CommandCategory;

pub use crate::proto::request::Kind as DeviceRequest;
pub use crate::proto::response::Kind as DeviceResponse;

/// Discriminant of a request, for logs and the response table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    DeviceInfo,
    BtcPub,
    EthPub,
    BtcSign,
    EthSign,
    EthSignTyped,
    AntiKleptoReveal,
    DataChunk,
    ContinueResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    DeviceInfo,
    Pub,
    SignerCommitment,
    Signature,
    DataRequest,
    Partial,
    Progress,
    Error,
}

pub fn request_kind(request: &Request) -> RequestKind {
    match request {
        Request::DeviceInfo(_) => RequestKind::DeviceInfo,
        Request::BtcPub(_) => RequestKind::BtcPub,
        Request::EthPub(_) => RequestKind::EthPub,
        Request::BtcSign(_) => RequestKind::BtcSign,
        Request::EthSign(_) => RequestKind::EthSign,
        Request::EthSignTyped(_) => RequestKind::EthSignTyped,
        Request::AntiKleptoReveal(_) => RequestKind::AntiKleptoReveal,
        Request::DataChunk(_) => RequestKind::DataChunk,
        Request::ContinueResponse(_) => RequestKind::ContinueResponse,
    }
}

pub fn response_kind(response: &Response) -> ResponseKind {
    match response {
        Response::DeviceInfo(_) => ResponseKind::DeviceInfo,
        Response::Pub(_) => ResponseKind::Pub,
        Response::SignerCommitment(_) => ResponseKind::SignerCommitment,
        Response::Signature(_) => ResponseKind::Signature,
        Response::DataRequest(_) => ResponseKind::DataRequest,
        Response::Partial(_) => ResponseKind::Partial,
        Response::Progress(_) => ResponseKind::Progress,
        Response::Error(_) => ResponseKind::Error,
    }
}

pub fn category(request: &Request) -> CommandCategory {
    match request_kind(request) {
        RequestKind::DeviceInfo | RequestKind::ContinueResponse => CommandCategory::Query,
        RequestKind::BtcPub | RequestKind::EthPub => CommandCategory::Keys,
        RequestKind::BtcSign
        | RequestKind::EthSign
        | RequestKind::EthSignTyped
        | RequestKind::AntiKleptoReveal
        | RequestKind::DataChunk => CommandCategory::Signing,
    }
}

/// Final response kinds each request may complete with. `Error`, `Progress`
/// and `Partial` are handled by the multiplexer before this table applies.
///
/// Signing requests also accept the kind that would break commitment order,
/// so the anti-klepto engine can report it as such.
pub fn accepted_responses(kind: RequestKind) -> &'static [ResponseKind] {
    match kind {
        RequestKind::DeviceInfo => &[ResponseKind::DeviceInfo],
        RequestKind::BtcPub | RequestKind::EthPub => &[ResponseKind::Pub],
        RequestKind::BtcSign | RequestKind::EthSignTyped => {
            &[ResponseKind::SignerCommitment, ResponseKind::Signature]
        }
        RequestKind::EthSign | RequestKind::DataChunk => &[
            ResponseKind::DataRequest,
            ResponseKind::SignerCommitment,
            ResponseKind::Signature,
        ],
        RequestKind::AntiKleptoReveal => {
            &[ResponseKind::Signature, ResponseKind::SignerCommitment]
        }
        RequestKind::ContinueResponse => &[],
    }
}

pub fn check_response(request: RequestKind, response: &Response) -> DeviceResult<()> {
    let kind = response_kind(response);
    if accepted_responses(request).contains(&kind) {
        Ok(())
    } else {
        debug!("{kind:?} is not a valid answer to {request:?}");
        Err(DeviceError::protocol(format!(
            "unexpected {kind:?} response to {request:?}"
        )))
    }
}

pub fn encode_request(id: u32, request: Request) -> Vec<u8> {
    RequestEnvelope {
        id,
        version: PROTOCOL_VERSION,
        kind: Some(request),
    }
    .encode_to_vec()
}

pub fn decode_request(bytes: &[u8]) -> DeviceResult<(u32, Request)> {
    let envelope = RequestEnvelope::decode(bytes)
        .map_err(|err| DeviceError::protocol(format!("undecodable request: {err}")))?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(DeviceError::protocol(format!(
            "unsupported request version {}",
            envelope.version
        )));
    }
    let kind = envelope
        .kind
        .ok_or_else(|| DeviceError::protocol("request without a known kind"))?;
    Ok((envelope.id, kind))
}

pub fn encode_response(id: u32, response: Response) -> Vec<u8> {
    ResponseEnvelope {
        id,
        version: PROTOCOL_VERSION,
        kind: Some(response),
    }
    .encode_to_vec()
}

/// Decodes a response and checks it answers call `expected_id`.
pub fn decode_response(expected_id: u32, bytes: &[u8]) -> DeviceResult<Response> {
    let envelope = ResponseEnvelope::decode(bytes)
        .map_err(|err| DeviceError::protocol(format!("undecodable response: {err}")))?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(DeviceError::protocol(format!(
            "unsupported response version {}",
            envelope.version
        )));
    }
    if envelope.id != expected_id {
        return Err(DeviceError::protocol(format!(
            "response id {} does not match request id {expected_id}",
            envelope.id
        )));
    }
    envelope
        .kind
        .ok_or_else(|| DeviceError::protocol("response without a known kind"))
}

/// Turns a device `Error` response into the matching [`DeviceError`].
pub fn device_error(err: &proto::ErrorResponse) -> DeviceError {
    match proto::ErrorCode::try_from(err.code) {
        Ok(proto::ErrorCode::UserAbort) => DeviceError::UserAborted,
        Ok(proto::ErrorCode::Busy) => DeviceError::DeviceBusy,
        Ok(proto::ErrorCode::Locked) => DeviceError::DeviceLocked,
        Ok(proto::ErrorCode::InvalidInput) => {
            DeviceError::protocol(format!("device rejected input: {}", err.message))
        }
        Ok(proto::ErrorCode::Generic) | Err(_) => DeviceError::DeviceFailure(err.message.clone()),
    }
}

/// Concatenates `Partial` pieces of a large response.
#[derive(Debug)]
pub struct PartialAssembler {
    buffer: Vec<u8>,
    limit: usize,
}

impl PartialAssembler {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn push(&mut self, piece: &[u8]) -> DeviceResult<()> {
        if self.buffer.len() + piece.len() > self.limit {
            return Err(DeviceError::protocol(format!(
                "partial response exceeds {} bytes",
                self.limit
            )));
        }
        self.buffer.extend_from_slice(piece);
        Ok(())
    }

    pub fn finish(self, expected_id: u32) -> DeviceResult<Response> {
        match decode_response(expected_id, &self.buffer)? {
            Response::Partial(_) => Err(DeviceError::protocol("nested partial response")),
            response => Ok(response),
        }
    }
}

/// Splits an encoded response into `Partial` pieces for the sending side.
pub fn split_response(id: u32, response: Response, piece_len: usize) -> Vec<Vec<u8>> {
    let encoded = encode_response(id, response);
    let pieces: Vec<&[u8]> = encoded.chunks(piece_len.max(1)).collect();
    let last = pieces.len().saturating_sub(1);
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| {
            encode_response(
                id,
                Response::Partial(proto::PartialResponse {
                    data: piece.to_vec(),
                    more: index != last,
                }),
            )
        })
        .collect()
}

/// Host side of a streamed Ethereum `data` field.
#[derive(Debug)]
pub struct DataStreamer {
    data: Vec<u8>,
    sent: usize,
}

impl DataStreamer {
    /// Returns the streamer and the inline first chunk.
    pub fn new(data: Vec<u8>) -> (Self, Vec<u8>) {
        let first = data.len().min(ETH_DATA_CHUNK_SIZE);
        let initial = data[..first].to_vec();
        (Self { data, sent: first }, initial)
    }

    pub fn total_len(&self) -> usize {
        self.data.len()
    }

    pub fn is_complete(&self) -> bool {
        self.sent == self.data.len()
    }

    /// Answers a device data request. The offset must continue exactly where
    /// the previous chunk ended.
    pub fn next_chunk(&mut self, offset: u32, length: u32) -> DeviceResult<Request> {
        let offset = offset as usize;
        if offset != self.sent {
            return Err(DeviceError::protocol(format!(
                "data request at offset {offset}, expected {}",
                self.sent
            )));
        }
        if length == 0 || length as usize > ETH_DATA_CHUNK_SIZE {
            return Err(DeviceError::protocol(format!(
                "data request length {length} out of range"
            )));
        }
        let end = offset
            .checked_add(length as usize)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| DeviceError::protocol("data request past the end of data"))?;
        self.sent = end;
        Ok(Request::DataChunk(proto::DataChunkRequest {
            offset: offset as u32,
            data: self.data[offset..end].to_vec(),
        }))
    }
}
