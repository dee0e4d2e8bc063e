//! PIV data-object identifiers (SP 800-73 "BER-TLV tags" sent as the
//! value of the `5C` tag list).

#[non_exhaustive]
pub struct ObjectId;

impl ObjectId {
    pub const CAPABILITY: u32 = 0x5F_C1_07;
    pub const CHUID: u32 = 0x5F_C1_02;
    pub const FINGERPRINTS: u32 = 0x5F_C1_03;
    pub const SECURITY: u32 = 0x5F_C1_06;
    pub const FACIAL: u32 = 0x5F_C1_08;
    pub const PRINTED: u32 = 0x5F_C1_09;
    pub const DISCOVERY: u32 = 0x7E;
    pub const KEY_HISTORY: u32 = 0x5F_C1_0C;
    pub const IRIS: u32 = 0x5F_C1_21;

    pub const AUTHENTICATION: u32 = 0x5F_C1_05;
    pub const SIGNATURE: u32 = 0x5F_C1_0A;
    pub const KEY_MANAGEMENT: u32 = 0x5F_C1_0B;
    pub const CARD_AUTH: u32 = 0x5F_C1_01;
    pub const ATTESTATION: u32 = 0x5F_FF_01;

    /// First retired-slot certificate; slots 82..95 map sequentially.
    pub const RETIRED_BASE: u32 = 0x5F_C1_0D;

    /// Encode an object id as the value of a `5C` tag list.
    pub fn encode(object_id: u32) -> Vec<u8> {
        let bytes = object_id.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        bytes[skip.min(3)..].to_vec()
    }
}
