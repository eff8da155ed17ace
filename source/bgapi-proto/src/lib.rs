//! # bgapi-proto
//!
//! Wire types for the BGAPI protocol spoken by the BT122 radio module.
//! Extracted as a separate crate so that both the firmware and the host-side
//! simulator can share the message definitions.
//!
//! Every message is a 4-byte [`Header`] followed by up to
//! [`MAX_PAYLOAD_LEN`] payload bytes. Only the messages needed to drive a
//! module firmware upgrade (DFU) are modelled; anything else is surfaced as
//! [`Message::Unknown`].

#![cfg_attr(not(any(test, feature = "use-std")), no_std)]

use core::fmt;

////////////////////////////////////////////////////////////////////////////////
// Framing
////////////////////////////////////////////////////////////////////////////////

/// Length of every BGAPI header, in bytes.
pub const HEADER_LEN: usize = 4;

/// The header has 11 bits of payload length.
pub const MAX_PAYLOAD_LEN: usize = 0x07ff;

/// Size of a buffer that can hold any message.
pub const MAX_MESSAGE_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

/// Device type bits for the "dumo" (BT121/BT122) command set.
pub const DEVICE_DUMO: u8 = 0x20;

const EVENT_FLAG: u8 = 0x80;
const LEN_HIGH_MASK: u8 = 0x07;
/// Clears the length bits of the first two header bytes.
const ID_MASK: u32 = 0xffff_00f8;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum MessageType {
    /// Commands sent to the module, and the responses it sends back. A
    /// response carries the same id as the command it answers.
    Command,
    /// Unsolicited events sent by the module.
    Event,
}

/// A message identifier: the header with its length bits masked out.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct MessageId(u32);

impl MessageId {
    pub const DFU_RESET: Self = Self::new(MessageType::Command, 0x00, 0x00);
    pub const DFU_FLASH_SET_ADDRESS: Self = Self::new(MessageType::Command, 0x00, 0x01);
    pub const DFU_FLASH_UPLOAD: Self = Self::new(MessageType::Command, 0x00, 0x02);
    pub const DFU_FLASH_UPLOAD_FINISH: Self = Self::new(MessageType::Command, 0x00, 0x03);
    pub const SYSTEM_RESET: Self = Self::new(MessageType::Command, 0x01, 0x01);

    pub const EVT_DFU_BOOT: Self = Self::new(MessageType::Event, 0x00, 0x00);
    pub const EVT_SYSTEM_BOOT: Self = Self::new(MessageType::Event, 0x01, 0x00);
    pub const EVT_SYSTEM_INITIALIZED: Self = Self::new(MessageType::Event, 0x01, 0x01);

    #[must_use]
    pub const fn new(ty: MessageType, class: u8, method: u8) -> Self {
        let b0 = match ty {
            MessageType::Command => DEVICE_DUMO,
            MessageType::Event => DEVICE_DUMO | EVENT_FLAG,
        };
        Self(u32::from_le_bytes([b0, 0, class, method]))
    }

    /// Builds an id from a raw little-endian header word.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & ID_MASK)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn message_type(self) -> MessageType {
        if self.0 as u8 & EVENT_FLAG != 0 {
            MessageType::Event
        } else {
            MessageType::Command
        }
    }

    #[must_use]
    pub const fn class(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[must_use]
    pub const fn method(self) -> u8 {
        (self.0 >> 24) as u8
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A raw BGAPI header.
///
/// Byte 0 holds the message type, device type and the top three bits of the
/// payload length; byte 1 the low eight length bits; bytes 2 and 3 the
/// class and method.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Header([u8; HEADER_LEN]);

impl Header {
    /// Creates the header for a message with the given id and payload length.
    pub fn new(id: MessageId, payload_len: usize) -> Result<Self, Error> {
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLong);
        }
        let [b0, _, class, method] = id.raw().to_le_bytes();
        let len_hi = (payload_len >> 8) as u8 & LEN_HIGH_MASK;
        Ok(Self([b0 | len_hi, payload_len as u8, class, method]))
    }

    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.0
    }

    #[inline]
    #[must_use]
    pub const fn payload_len(&self) -> usize {
        (((self.0[0] & LEN_HIGH_MASK) as usize) << 8) | self.0[1] as usize
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> MessageId {
        MessageId::from_raw(u32::from_le_bytes(self.0))
    }
}

/// Returns the full length of the message starting at `prefix`, once enough
/// of it has arrived to know.
#[must_use]
pub fn frame_len(prefix: &[u8]) -> Option<usize> {
    let header: [u8; HEADER_LEN] = prefix.get(..HEADER_LEN)?.try_into().ok()?;
    Some(HEADER_LEN + Header::from_bytes(header).payload_len())
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Error {
    /// The provided buffer is not suitable in size
    InsufficientSize,
    /// The payload is longer than a header (or a length-prefixed byte array)
    /// can describe
    PayloadTooLong,
    /// The payload is shorter than the message with this id requires
    MalformedPayload(MessageId),
    /// The id does not belong to any known command
    UnknownCommand(MessageId),
    /// The input ended partway through a message
    UnexpectedEnd,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientSize => f.write_str("buffer too small for message"),
            Self::PayloadTooLong => f.write_str("payload too long"),
            Self::MalformedPayload(id) => write!(f, "malformed payload for message {id}"),
            Self::UnknownCommand(id) => write!(f, "unknown command {id}"),
            Self::UnexpectedEnd => f.write_str("input ended partway through a message"),
        }
    }
}

#[cfg(feature = "use-std")]
impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////////////
// Payload cursors
////////////////////////////////////////////////////////////////////////////////

struct Reader<'a> {
    id: MessageId,
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.data.len() < n {
            return Err(Error::MalformedPayload(self.id));
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, Error> {
        self.array().map(u32::from_le_bytes)
    }

    /// A `uint8array`: one length byte, then that many bytes.
    fn byte_array(&mut self) -> Result<&'a [u8], Error> {
        let len = self.u8()?;
        self.take(usize::from(len))
    }
}

struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) {
        // `encode` sizes the buffer from `payload_len` before writing.
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

fn encode<'b>(
    id: MessageId,
    payload_len: usize,
    out: &'b mut [u8],
    fill: impl FnOnce(&mut Writer<'_>),
) -> Result<&'b mut [u8], Error> {
    let header = Header::new(id, payload_len)?;
    let total = HEADER_LEN + payload_len;
    let out = out.get_mut(..total).ok_or(Error::InsufficientSize)?;
    let mut w = Writer {
        buf: &mut *out,
        pos: 0,
    };
    w.put(header.as_bytes());
    fill(&mut w);
    debug_assert_eq!(w.pos, total, "payload_len disagrees with encoder");
    Ok(out)
}

////////////////////////////////////////////////////////////////////////////////
// Commands
////////////////////////////////////////////////////////////////////////////////

/// Commands sent from the host to the module.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Command<'a> {
    /// Reboot the module, into its DFU bootloader if `dfu` is set.
    DfuReset { dfu: bool },
    /// Set the module flash address the next upload is written to.
    DfuFlashSetAddress { address: u32 },
    /// Write a chunk of the new image. At most [`Command::MAX_UPLOAD_CHUNK`]
    /// bytes.
    DfuFlashUpload { data: &'a [u8] },
    /// Tell the bootloader that the whole image has been uploaded.
    DfuFlashUploadFinish,
    /// Reboot the module (normal application mode unless `dfu` is set).
    SystemReset { dfu: bool },
}

impl<'a> Command<'a> {
    /// Upload data is sent as a `uint8array`, so its length must fit a byte.
    pub const MAX_UPLOAD_CHUNK: usize = u8::MAX as usize;

    #[must_use]
    pub fn id(&self) -> MessageId {
        match self {
            Self::DfuReset { .. } => MessageId::DFU_RESET,
            Self::DfuFlashSetAddress { .. } => MessageId::DFU_FLASH_SET_ADDRESS,
            Self::DfuFlashUpload { .. } => MessageId::DFU_FLASH_UPLOAD,
            Self::DfuFlashUploadFinish => MessageId::DFU_FLASH_UPLOAD_FINISH,
            Self::SystemReset { .. } => MessageId::SYSTEM_RESET,
        }
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::DfuReset { .. } | Self::SystemReset { .. } => 1,
            Self::DfuFlashSetAddress { .. } => 4,
            Self::DfuFlashUpload { data } => 1 + data.len(),
            Self::DfuFlashUploadFinish => 0,
        }
    }

    /// Calculate the size required to encode this command
    #[inline]
    #[must_use]
    pub fn buffer_required(&self) -> usize {
        HEADER_LEN + self.payload_len()
    }

    /// Encodes the command, header included, into the front of `out`.
    pub fn encode_to<'b>(&self, out: &'b mut [u8]) -> Result<&'b mut [u8], Error> {
        if let Self::DfuFlashUpload { data } = self {
            if data.len() > Self::MAX_UPLOAD_CHUNK {
                return Err(Error::PayloadTooLong);
            }
        }
        encode(self.id(), self.payload_len(), out, |w| match *self {
            Self::DfuReset { dfu } | Self::SystemReset { dfu } => w.put(&[u8::from(dfu)]),
            Self::DfuFlashSetAddress { address } => w.put(&address.to_le_bytes()),
            Self::DfuFlashUpload { data } => {
                w.put(&[data.len() as u8]);
                w.put(data);
            }
            Self::DfuFlashUploadFinish => {}
        })
    }

    /// Decodes a command, as seen by the module.
    pub fn decode(header: &Header, payload: &'a [u8]) -> Result<Self, Error> {
        let id = header.id();
        let mut r = Reader { id, data: payload };
        let cmd = match id {
            MessageId::DFU_RESET => Self::DfuReset { dfu: r.u8()? != 0 },
            MessageId::DFU_FLASH_SET_ADDRESS => Self::DfuFlashSetAddress { address: r.u32()? },
            MessageId::DFU_FLASH_UPLOAD => Self::DfuFlashUpload {
                data: r.byte_array()?,
            },
            MessageId::DFU_FLASH_UPLOAD_FINISH => Self::DfuFlashUploadFinish,
            MessageId::SYSTEM_RESET => Self::SystemReset { dfu: r.u8()? != 0 },
            other => return Err(Error::UnknownCommand(other)),
        };
        Ok(cmd)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Responses and Events
////////////////////////////////////////////////////////////////////////////////

/// Payload of the `system_boot` event, sent when the module starts its
/// application firmware.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct SystemBoot {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub build: u16,
    pub bootloader: u16,
    pub hw: u16,
}

/// Messages sent from the module to the host.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Message<'a> {
    /// The module booted into its DFU bootloader.
    DfuBoot { bootloader_version: u32 },
    /// The module booted its application firmware.
    SystemBoot(SystemBoot),
    /// The module's stack is up and has a Bluetooth address.
    SystemInitialized { address: [u8; 6] },
    DfuFlashSetAddressRsp { result: u16 },
    DfuFlashUploadRsp { result: u16 },
    DfuFlashUploadFinishRsp { result: u16 },
    /// Anything else. Upgrade logic ignores these.
    Unknown { id: MessageId, payload: &'a [u8] },
}

impl<'a> Message<'a> {
    #[must_use]
    pub fn id(&self) -> MessageId {
        match self {
            Self::DfuBoot { .. } => MessageId::EVT_DFU_BOOT,
            Self::SystemBoot(_) => MessageId::EVT_SYSTEM_BOOT,
            Self::SystemInitialized { .. } => MessageId::EVT_SYSTEM_INITIALIZED,
            Self::DfuFlashSetAddressRsp { .. } => MessageId::DFU_FLASH_SET_ADDRESS,
            Self::DfuFlashUploadRsp { .. } => MessageId::DFU_FLASH_UPLOAD,
            Self::DfuFlashUploadFinishRsp { .. } => MessageId::DFU_FLASH_UPLOAD_FINISH,
            Self::Unknown { id, .. } => *id,
        }
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::DfuBoot { .. } => 4,
            Self::SystemBoot(_) => 12,
            Self::SystemInitialized { .. } => 6,
            Self::DfuFlashSetAddressRsp { .. }
            | Self::DfuFlashUploadRsp { .. }
            | Self::DfuFlashUploadFinishRsp { .. } => 2,
            Self::Unknown { payload, .. } => payload.len(),
        }
    }

    /// Calculate the size required to encode this message
    #[inline]
    #[must_use]
    pub fn buffer_required(&self) -> usize {
        HEADER_LEN + self.payload_len()
    }

    /// Encodes the message, header included, into the front of `out`.
    pub fn encode_to<'b>(&self, out: &'b mut [u8]) -> Result<&'b mut [u8], Error> {
        encode(self.id(), self.payload_len(), out, |w| match *self {
            Self::DfuBoot { bootloader_version } => w.put(&bootloader_version.to_le_bytes()),
            Self::SystemBoot(boot) => {
                for field in [
                    boot.major,
                    boot.minor,
                    boot.patch,
                    boot.build,
                    boot.bootloader,
                    boot.hw,
                ] {
                    w.put(&field.to_le_bytes());
                }
            }
            Self::SystemInitialized { address } => w.put(&address),
            Self::DfuFlashSetAddressRsp { result }
            | Self::DfuFlashUploadRsp { result }
            | Self::DfuFlashUploadFinishRsp { result } => w.put(&result.to_le_bytes()),
            Self::Unknown { payload, .. } => w.put(payload),
        })
    }

    /// Decodes a response or event, as seen by the host.
    ///
    /// Ids that are not modelled here decode successfully as
    /// [`Message::Unknown`].
    pub fn decode(header: &Header, payload: &'a [u8]) -> Result<Self, Error> {
        let id = header.id();
        let mut r = Reader { id, data: payload };
        let msg = match id {
            MessageId::EVT_DFU_BOOT => Self::DfuBoot {
                bootloader_version: r.u32()?,
            },
            MessageId::EVT_SYSTEM_BOOT => Self::SystemBoot(SystemBoot {
                major: r.u16()?,
                minor: r.u16()?,
                patch: r.u16()?,
                build: r.u16()?,
                bootloader: r.u16()?,
                hw: r.u16()?,
            }),
            MessageId::EVT_SYSTEM_INITIALIZED => Self::SystemInitialized {
                address: r.array()?,
            },
            MessageId::DFU_FLASH_SET_ADDRESS => Self::DfuFlashSetAddressRsp { result: r.u16()? },
            MessageId::DFU_FLASH_UPLOAD => Self::DfuFlashUploadRsp { result: r.u16()? },
            MessageId::DFU_FLASH_UPLOAD_FINISH => Self::DfuFlashUploadFinishRsp { result: r.u16()? },
            id => Self::Unknown { id, payload },
        };
        Ok(msg)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Reading frames
////////////////////////////////////////////////////////////////////////////////

/// A source of bytes that can fill a buffer completely or fail.
pub trait ReadExact {
    type Error;

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Self::Error>;
}

impl ReadExact for &[u8] {
    type Error = Error;

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        if self.len() < buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, rest) = self.split_at(buf.len());
        buf.copy_from_slice(head);
        *self = rest;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadError<E> {
    /// The underlying reader failed
    Io(E),
    /// The bytes read do not form a usable message
    Frame(Error),
}

impl<E: fmt::Display> fmt::Display for ReadError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read message: {e}"),
            Self::Frame(e) => write!(f, "bad message: {e}"),
        }
    }
}

/// A header plus the payload bytes that follow it.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Frame<'a> {
    pub header: Header,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    #[inline]
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.header.id()
    }

    pub fn message(&self) -> Result<Message<'a>, Error> {
        Message::decode(&self.header, self.payload)
    }

    pub fn command(&self) -> Result<Command<'a>, Error> {
        Command::decode(&self.header, self.payload)
    }
}

/// Reads one message from `reader` into `buf`.
///
/// A single byte is read first. The module can emit a spurious `0x00` when it
/// resets, and no valid header starts with zero, so if that byte is zero it
/// is dropped and a full header is read after it. Otherwise it is kept as the
/// first header byte. The payload is read into `buf` right after the header.
pub fn read_frame<'b, R>(reader: &mut R, buf: &'b mut [u8]) -> Result<Frame<'b>, ReadError<R::Error>>
where
    R: ReadExact + ?Sized,
{
    if buf.len() < HEADER_LEN {
        return Err(ReadError::Frame(Error::InsufficientSize));
    }

    reader.read_exact(&mut buf[..1]).map_err(ReadError::Io)?;
    if buf[0] == 0 {
        reader
            .read_exact(&mut buf[..HEADER_LEN])
            .map_err(ReadError::Io)?;
    } else {
        reader
            .read_exact(&mut buf[1..HEADER_LEN])
            .map_err(ReadError::Io)?;
    }

    let header = Header::from_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let len = header.payload_len();
    let payload = buf
        .get_mut(HEADER_LEN..HEADER_LEN + len)
        .ok_or(ReadError::Frame(Error::InsufficientSize))?;
    if len != 0 {
        reader.read_exact(payload).map_err(ReadError::Io)?;
    }

    Ok(Frame { header, payload })
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn message_ids_match_module_documentation() {
        assert_eq!(MessageId::DFU_RESET.raw(), 0x0000_0020);
        assert_eq!(MessageId::DFU_FLASH_SET_ADDRESS.raw(), 0x0100_0020);
        assert_eq!(MessageId::DFU_FLASH_UPLOAD.raw(), 0x0200_0020);
        assert_eq!(MessageId::DFU_FLASH_UPLOAD_FINISH.raw(), 0x0300_0020);
        assert_eq!(MessageId::SYSTEM_RESET.raw(), 0x0101_0020);
        assert_eq!(MessageId::EVT_DFU_BOOT.raw(), 0x0000_00a0);
        assert_eq!(MessageId::EVT_SYSTEM_BOOT.raw(), 0x0001_00a0);
        assert_eq!(MessageId::EVT_SYSTEM_INITIALIZED.raw(), 0x0101_00a0);

        assert_eq!(MessageId::EVT_SYSTEM_BOOT.message_type(), MessageType::Event);
        assert_eq!(MessageId::SYSTEM_RESET.class(), 0x01);
        assert_eq!(MessageId::DFU_FLASH_UPLOAD.method(), 0x02);
    }

    #[test]
    fn header_length_bits() {
        let header = Header::new(MessageId::DFU_FLASH_UPLOAD, 0x0123).unwrap();
        assert_eq!(header.as_bytes(), &[0x21, 0x23, 0x00, 0x02]);
        assert_eq!(header.payload_len(), 0x0123);
        assert_eq!(header.id(), MessageId::DFU_FLASH_UPLOAD);

        let header = Header::new(MessageId::EVT_DFU_BOOT, MAX_PAYLOAD_LEN).unwrap();
        assert_eq!(header.payload_len(), MAX_PAYLOAD_LEN);
        assert_eq!(header.id(), MessageId::EVT_DFU_BOOT);

        assert_eq!(
            Header::new(MessageId::EVT_DFU_BOOT, MAX_PAYLOAD_LEN + 1),
            Err(Error::PayloadTooLong)
        );
    }

    #[test]
    fn encode_commands() {
        let mut buf = [0u8; 16];
        let res = Command::DfuReset { dfu: true }.encode_to(&mut buf).unwrap();
        assert_eq!(res, &[0x20, 0x01, 0x00, 0x00, 0x01]);

        let res = Command::DfuFlashSetAddress { address: 0 }
            .encode_to(&mut buf)
            .unwrap();
        assert_eq!(res, &[0x20, 0x04, 0x00, 0x01, 0, 0, 0, 0]);

        let res = Command::DfuFlashUpload { data: &[0xAA, 0xBB] }
            .encode_to(&mut buf)
            .unwrap();
        assert_eq!(res, &[0x20, 0x03, 0x00, 0x02, 0x02, 0xAA, 0xBB]);

        let res = Command::DfuFlashUploadFinish.encode_to(&mut buf).unwrap();
        assert_eq!(res, &[0x20, 0x00, 0x00, 0x03]);

        let mut tiny = [0u8; 4];
        assert_eq!(
            Command::DfuReset { dfu: false }.encode_to(&mut tiny),
            Err(Error::InsufficientSize)
        );
    }

    #[test]
    fn upload_chunk_must_fit_a_byte() {
        let data = [0u8; 256];
        let mut buf = [0u8; 300];
        assert_eq!(
            Command::DfuFlashUpload { data: &data }.encode_to(&mut buf),
            Err(Error::PayloadTooLong)
        );
    }

    #[test]
    fn decode_system_boot() {
        let bytes = [
            0xa0, 0x0c, 0x01, 0x00, // header
            1, 0, 2, 0, 3, 0, 0x34, 0x12, 7, 0, 0x22, 0x01,
        ];
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let frame = read_frame(&mut &bytes[..], &mut buf).unwrap();
        assert_eq!(
            frame.message().unwrap(),
            Message::SystemBoot(SystemBoot {
                major: 1,
                minor: 2,
                patch: 3,
                build: 0x1234,
                bootloader: 7,
                hw: 0x0122,
            })
        );
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let header = Header::new(MessageId::EVT_DFU_BOOT, 2).unwrap();
        assert_eq!(
            Message::decode(&header, &[1, 2]),
            Err(Error::MalformedPayload(MessageId::EVT_DFU_BOOT))
        );
    }

    #[test]
    fn unknown_ids_are_preserved() {
        let id = MessageId::new(MessageType::Event, 0x07, 0x03);
        let header = Header::new(id, 3).unwrap();
        let msg = Message::decode(&header, &[9, 8, 7]).unwrap();
        assert_eq!(
            msg,
            Message::Unknown {
                id,
                payload: &[9, 8, 7]
            }
        );
        assert_eq!(
            Command::decode(&header, &[9, 8, 7]),
            Err(Error::UnknownCommand(id))
        );
    }

    #[test]
    fn leading_zero_is_skipped() {
        let mut wire = vec![0u8];
        let mut buf = [0u8; 16];
        wire.extend_from_slice(
            Message::DfuFlashUploadRsp { result: 0 }
                .encode_to(&mut buf)
                .unwrap(),
        );

        let mut reader = &wire[..];
        let mut out = [0u8; 16];
        let frame = read_frame(&mut reader, &mut out).unwrap();
        assert_eq!(frame.message(), Ok(Message::DfuFlashUploadRsp { result: 0 }));
        assert!(reader.is_empty());
    }

    #[test]
    fn short_input_is_an_io_error() {
        let wire = [0x20, 0x04, 0x00];
        let mut out = [0u8; 16];
        assert_eq!(
            read_frame(&mut &wire[..], &mut out),
            Err(ReadError::Io(Error::UnexpectedEnd))
        );
    }

    #[test]
    fn frame_len_needs_a_header() {
        assert_eq!(frame_len(&[0x20, 0x01]), None);
        assert_eq!(frame_len(&[0x20, 0x01, 0x00, 0x00]), Some(5));
    }

    proptest! {
        #[test]
        fn resync_reconstructs_the_same_header(
            class in any::<u8>(),
            method in any::<u8>(),
            event in any::<bool>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let ty = if event { MessageType::Event } else { MessageType::Command };
            let id = MessageId::new(ty, class, method);
            let msg = Message::Unknown { id, payload: &payload };
            let mut enc = [0u8; 128];
            let clean = msg.encode_to(&mut enc).unwrap().to_vec();

            let mut desynced = vec![0u8];
            desynced.extend_from_slice(&clean);

            let mut a = [0u8; 128];
            let mut b = [0u8; 128];
            let fa = read_frame(&mut &clean[..], &mut a).unwrap();
            let fb = read_frame(&mut &desynced[..], &mut b).unwrap();
            prop_assert_eq!(fa.header.as_bytes(), fb.header.as_bytes());
            prop_assert_eq!(fa.payload, fb.payload);
            prop_assert_eq!(&a[..clean.len()], &clean[..]);
        }
    }
}
