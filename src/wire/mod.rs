//! Wire layer: packet framing, CRC16, encryption and the SSP command ID
//! vocabulary (§3/§4.A/§6).

pub mod command_ids;
pub mod crc;
pub mod crypto;
pub mod frame;

pub use crc::crc16;
pub use crypto::{
    derive_session_key, Aes128CtrCipher, CryptoError, EncryptedSubPacket, KeyAgreement,
    ModExpKeyAgreement, SspCipher,
};
pub use frame::{resync, FrameError, Packet, PacketCodec, MAX_PAYLOAD_LEN, STX};
