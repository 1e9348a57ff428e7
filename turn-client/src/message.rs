use crate::error::{Result, TurnError};
use bytes::{BufMut, Bytes, BytesMut};
use stun_rs::attributes::stun::{ErrorCode, MessageIntegrity, Nonce, Realm};
use stun_rs::attributes::turn::RequestedTrasport;
use stun_rs::protocols::{ProtocolNumber, UDP};
use stun_rs::{
    MessageClass, MessageDecoderBuilder, MessageEncoderBuilder, MessageMethod, StunAttribute,
    StunAttributeType, StunMessage, StunMessageBuilder, TransactionId, MAGIC_COOKIE,
    MESSAGE_HEADER_SIZE,
};

const ENCODE_CAPACITY: usize = 1024;
const TRANSACTION_ID_RANGE: std::ops::Range<usize> = 8..20;
const TCP_PROTOCOL_NUMBER: u8 = 6;

pub(crate) const CHANNEL_DATA_HEADER_SIZE: usize = 4;

/// Attributes of an outgoing request or indication. MESSAGE-INTEGRITY is
/// always kept apart so it ends up as the last attribute of the message,
/// which lets a request be re-signed with new credentials by simply adding
/// the authentication attributes again.
#[derive(Debug, Default)]
pub struct StunAttributes {
    attributes: Vec<StunAttribute>,
    integrity: Option<StunAttribute>,
}

impl StunAttributes {
    /// Adds an attribute. An attribute of the same type already present is replaced.
    pub fn add<T>(&mut self, attribute: T)
    where
        T: Into<StunAttribute>,
    {
        let attr = attribute.into();

        if attr.is_message_integrity() {
            self.integrity = Some(attr);
        } else if let Some(index) = self
            .attributes
            .iter()
            .position(|a| a.attribute_type() == attr.attribute_type())
        {
            self.attributes[index] = attr;
        } else {
            self.attributes.push(attr);
        }
    }

    /// Appends an attribute even if one of the same type is already present,
    /// e.g. one XOR-PEER-ADDRESS per peer in a CreatePermission request.
    pub fn push<T>(&mut self, attribute: T)
    where
        T: Into<StunAttribute>,
    {
        let attr = attribute.into();
        if attr.is_message_integrity() {
            self.integrity = Some(attr);
        } else {
            self.attributes.push(attr);
        }
    }

    /// Removes the attribute of type `T`, returning it if it was present.
    pub fn remove<T>(&mut self) -> Option<StunAttribute>
    where
        T: StunAttributeType,
    {
        if T::get_type() == MessageIntegrity::get_type() {
            return self.integrity.take();
        }
        let index = self
            .attributes
            .iter()
            .position(|a| a.attribute_type() == T::get_type())?;
        Some(self.attributes.remove(index))
    }

    pub fn len(&self) -> usize {
        self.attributes.len() + usize::from(self.integrity.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<StunAttributes> for Vec<StunAttribute> {
    fn from(val: StunAttributes) -> Self {
        let mut attributes = val.attributes;
        if let Some(attr) = val.integrity {
            attributes.push(attr);
        }
        attributes
    }
}

pub fn create_stun_message(
    method: MessageMethod,
    class: MessageClass,
    transaction_id: TransactionId,
    attributes: StunAttributes,
) -> StunMessage {
    let attributes: Vec<StunAttribute> = attributes.into();
    attributes.into_iter().fold(
        StunMessageBuilder::new(method, class).with_transaction_id(transaction_id),
        |builder, attr| builder.with_attribute(attr),
    )
    .build()
}

/// Encodes `msg`. `payload` is the size of any DATA carried by the message,
/// used to size the output buffer.
pub(crate) fn encode_message(msg: &StunMessage, payload: usize) -> Result<Bytes> {
    let mut buffer = BytesMut::zeroed(ENCODE_CAPACITY + payload);
    let size = MessageEncoderBuilder::default()
        .build()
        .encode(buffer.as_mut(), msg)
        .map_err(TurnError::codec)?;
    buffer.truncate(size);
    Ok(buffer.freeze())
}

pub(crate) fn decode_message(buffer: &[u8]) -> Result<StunMessage> {
    let (msg, _) = MessageDecoderBuilder::default()
        .build()
        .decode(buffer)
        .map_err(TurnError::codec)?;
    Ok(msg)
}

/// Checks the fixed parts of a STUN header: the two most significant bits
/// are zero and the magic cookie is present.
pub(crate) fn is_stun_message(buffer: &[u8]) -> bool {
    if buffer.len() < MESSAGE_HEADER_SIZE || buffer[0] & 0xC0 != 0 {
        return false;
    }
    buffer[4..8] == MAGIC_COOKIE.as_u32().to_be_bytes()
}

/// Reads the transaction id straight from the header, so that a message
/// whose attributes fail to decode can still be matched to its request.
pub(crate) fn peek_transaction_id(buffer: &[u8]) -> Option<TransactionId> {
    if !is_stun_message(buffer) {
        return None;
    }
    let bytes: [u8; 12] = buffer[TRANSACTION_ID_RANGE].try_into().ok()?;
    Some(TransactionId::from(bytes))
}

/// Returns the numeric code and reason of an error response.
pub(crate) fn error_code(msg: &StunMessage) -> Option<(u16, String)> {
    let attr = msg.get::<ErrorCode>()?.as_error_code().ok()?;
    let error = attr.error_code();
    Some((error.error_code(), error.reason().to_string()))
}

pub(crate) fn nonce(msg: &StunMessage) -> Option<Nonce> {
    msg.get::<Nonce>()?.as_nonce().ok().cloned()
}

pub(crate) fn realm(msg: &StunMessage) -> Option<Realm> {
    msg.get::<Realm>()?.as_realm().ok().cloned()
}

/// Transport protocol of a relayed transport address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayProtocol {
    Udp,
    Tcp,
}

impl RelayProtocol {
    pub(crate) fn requested_transport(self) -> Result<RequestedTrasport> {
        let protocol = match self {
            RelayProtocol::Udp => UDP,
            RelayProtocol::Tcp => protocol_number(TCP_PROTOCOL_NUMBER)?,
        };
        Ok(RequestedTrasport::from(protocol))
    }
}

// stun-rs only exports the UDP code point, so any other protocol number is
// obtained by decoding a REQUESTED-TRANSPORT attribute that carries it.
fn protocol_number(value: u8) -> Result<ProtocolNumber> {
    let mut buffer = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + 8);
    buffer.put_u16(0x0001);
    buffer.put_u16(8);
    buffer.put_u32(MAGIC_COOKIE.as_u32());
    buffer.put_bytes(0, 12);
    buffer.put_u16(RequestedTrasport::get_type().as_u16());
    buffer.put_u16(4);
    buffer.put_slice(&[value, 0, 0, 0]);

    let msg = decode_message(&buffer)?;
    let attr = msg
        .get::<RequestedTrasport>()
        .ok_or_else(|| TurnError::Protocol("missing REQUESTED-TRANSPORT".to_string()))?;
    Ok(attr.as_requested_trasport()?.protocol())
}

pub(crate) fn is_channel_data(buffer: &[u8]) -> bool {
    buffer.len() >= CHANNEL_DATA_HEADER_SIZE && buffer[0] & 0xC0 == 0x40
}

/// ChannelData message: a channel number, a length and the application data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChannelData {
    pub number: u16,
    pub data: Bytes,
}

impl ChannelData {
    /// Stream transports pad the message to a multiple of four bytes.
    pub fn encode(&self, padded: bool) -> Result<Bytes> {
        let length = u16::try_from(self.data.len())
            .map_err(|_| TurnError::Protocol(format!("payload too large: {}", self.data.len())))?;
        let mut size = CHANNEL_DATA_HEADER_SIZE + self.data.len();
        if padded {
            size = (size + 3) & !3;
        }
        let mut buffer = BytesMut::with_capacity(size);
        buffer.put_u16(self.number);
        buffer.put_u16(length);
        buffer.put_slice(&self.data);
        buffer.resize(size, 0);
        Ok(buffer.freeze())
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if !is_channel_data(buffer) {
            return Err(TurnError::Protocol("not a ChannelData message".to_string()));
        }
        let number = u16::from_be_bytes([buffer[0], buffer[1]]);
        let length = usize::from(u16::from_be_bytes([buffer[2], buffer[3]]));
        let end = CHANNEL_DATA_HEADER_SIZE + length;
        if buffer.len() < end {
            return Err(TurnError::Protocol(format!(
                "ChannelData length {} exceeds buffer of {} bytes",
                length,
                buffer.len()
            )));
        }
        Ok(Self {
            number,
            data: Bytes::copy_from_slice(&buffer[CHANNEL_DATA_HEADER_SIZE..end]),
        })
    }
}
