/*
 A NIC image stores every disk sector in its own 512 byte block,
 already nibblized, exactly as the drive would stream it:

 22   gap (0xFF)
 12   10-bit self-sync bytes, bit packed
 14   address field  D5 AA 96 vol vol trk trk sec sec chk chk DE AA EB
  5   gap (0xFF)
 349  data field     D5 AA AD <343 6-and-2 bytes> DE AA EB
 14   gap (0xFF)
 96   padding (0x00)
*/

use crate::storage::BLOCK_SIZE;

pub const GAP1_OFFSET: usize = 0;
pub const GAP1_LEN: usize = 22;
pub const SYNC_OFFSET: usize = GAP1_OFFSET + GAP1_LEN;
pub const SYNC_PATTERN: [u8; 12] = [
    0x03, 0xFC, 0xFF, 0x3F, 0xCF, 0xF3, 0xFC, 0xFF, 0x3F, 0xCF, 0xF3, 0xFC,
];
pub const ADDRESS_OFFSET: usize = SYNC_OFFSET + SYNC_PATTERN.len();
pub const ADDRESS_LEN: usize = 14;
pub const GAP2_OFFSET: usize = ADDRESS_OFFSET + ADDRESS_LEN;
pub const GAP2_LEN: usize = 5;
pub const DATA_OFFSET: usize = GAP2_OFFSET + GAP2_LEN;
pub const DATA_LEN: usize = 349;
pub const GAP3_OFFSET: usize = DATA_OFFSET + DATA_LEN;
pub const GAP3_LEN: usize = 14;
pub const PAD_OFFSET: usize = GAP3_OFFSET + GAP3_LEN;

/// Bytes the drive streams per sector. Everything after is never read.
pub const STREAM_LEN: usize = GAP3_OFFSET;

pub const MARK_PROLOGUE: [u8; 2] = [0xD5, 0xAA];
pub const ADDRESS_MARK: u8 = 0x96;
pub const DATA_MARK: u8 = 0xAD;
pub const EPILOGUE: [u8; 3] = [0xDE, 0xAA, 0xEB];

/// Encoded payload bytes between the data mark and the epilogue.
pub const PAYLOAD_LEN: usize = 343;
/// Address field bytes after the three byte mark.
pub const ADDRESS_BODY_LEN: usize = 8 + EPILOGUE.len();
/// Data field bytes after the three byte mark.
pub const DATA_BODY_LEN: usize = PAYLOAD_LEN + EPILOGUE.len();

pub type SectorImage = [u8; BLOCK_SIZE];

/// Spread a byte over two, odd bits first, padded with ones.
pub fn encode_44(value: u8) -> [u8; 2] {
    return [(value >> 1) | 0xAA, value | 0xAA];
}

pub fn decode_44(pair: [u8; 2]) -> u8 {
    return ((pair[0] & 0x55) << 1) | (pair[1] & 0x55);
}

/// Contents of an address field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AddressField {
    pub volume: u8,
    pub track: u8,
    pub sector: u8,
    pub checksum: u8,
}

impl AddressField {
    /// Header with a freshly computed checksum.
    pub fn new(volume: u8, track: u8, sector: u8) -> Self {
        return AddressField {
            volume,
            track,
            sector,
            checksum: volume ^ track ^ sector,
        };
    }

    /// Parse the 8 encoded bytes that follow `D5 AA 96`. The checksum is
    /// taken as-is.
    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < 8 {
            return None;
        }

        return Some(AddressField {
            volume: decode_44([body[0], body[1]]),
            track: decode_44([body[2], body[3]]),
            sector: decode_44([body[4], body[5]]),
            checksum: decode_44([body[6], body[7]]),
        });
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        for (i, value) in [self.volume, self.track, self.sector, self.checksum]
            .iter()
            .enumerate()
        {
            out[i * 2..i * 2 + 2].copy_from_slice(&encode_44(*value));
        }
        return out;
    }

    pub fn checksum_ok(&self) -> bool {
        return self.checksum == self.volume ^ self.track ^ self.sector;
    }
}

/**
Build a full NIC block from a header and a data field body. `body` is
 whatever followed `D5 AA AD` on the wire: normally 343 payload bytes plus
 the epilogue, but a short capture is written through as-is and the rest
 of the field keeps the gap value.
*/
pub fn compose(header: &AddressField, body: &[u8]) -> SectorImage {
    let mut image = [0u8; BLOCK_SIZE];

    image[GAP1_OFFSET..SYNC_OFFSET].fill(0xFF);
    image[SYNC_OFFSET..ADDRESS_OFFSET].copy_from_slice(&SYNC_PATTERN);

    let address = &mut image[ADDRESS_OFFSET..GAP2_OFFSET];
    address[0..2].copy_from_slice(&MARK_PROLOGUE);
    address[2] = ADDRESS_MARK;
    address[3..11].copy_from_slice(&header.encode());
    address[11..14].copy_from_slice(&EPILOGUE);

    image[GAP2_OFFSET..DATA_OFFSET].fill(0xFF);

    let data = &mut image[DATA_OFFSET..GAP3_OFFSET];
    data.fill(0xFF);
    data[0..2].copy_from_slice(&MARK_PROLOGUE);
    data[2] = DATA_MARK;
    let len = body.len().min(DATA_BODY_LEN);
    data[3..3 + len].copy_from_slice(&body[..len]);

    image[GAP3_OFFSET..PAD_OFFSET].fill(0xFF);
    // Padding stays zero

    return image;
}

/// Read back the header of a NIC block.
pub fn header_of(image: &SectorImage) -> Option<AddressField> {
    let address = &image[ADDRESS_OFFSET..GAP2_OFFSET];
    if address[0..2] != MARK_PROLOGUE || address[2] != ADDRESS_MARK {
        return None;
    }
    return AddressField::decode(&address[3..11]);
}

/// Data field body (payload and epilogue) of a NIC block.
pub fn data_body(image: &SectorImage) -> &[u8] {
    return &image[DATA_OFFSET + 3..GAP3_OFFSET];
}
