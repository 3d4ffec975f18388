//! Datagram classification.
//!
//! Parses just enough of a datagram's header to route it: kind, version,
//! SCID, DCID, token. Parsing is delegated to the QUIC library; no routing
//! decisions are made here.

use crate::error::DropReason;
use crate::peer::PeerAddr;
use crate::routing::LOCAL_CID_LEN;

/// QUIC packet kind as derived from the header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Initial,
    Handshake,
    ZeroRtt,
    Short,
    Retry,
    VersionNegotiation,
}

impl From<quiche::Type> for PacketKind {
    fn from(ty: quiche::Type) -> Self {
        match ty {
            quiche::Type::Initial => PacketKind::Initial,
            quiche::Type::Handshake => PacketKind::Handshake,
            quiche::Type::ZeroRTT => PacketKind::ZeroRtt,
            quiche::Type::Short => PacketKind::Short,
            quiche::Type::Retry => PacketKind::Retry,
            quiche::Type::VersionNegotiation => PacketKind::VersionNegotiation,
        }
    }
}

/// A datagram with its header fields extracted, ready for routing.
#[derive(Debug)]
pub struct ClassifiedDatagram {
    pub peer: PeerAddr,
    /// The full datagram, untouched; forwarded to the owning connection.
    pub payload: Vec<u8>,
    pub scid: Vec<u8>,
    pub dcid: Vec<u8>,
    /// Address-validation token carried by an Initial, if any.
    pub token: Option<Vec<u8>>,
    pub version: u32,
    pub kind: PacketKind,
    /// True iff `version` is in the server's supported set. Always true for
    /// short-header packets, which carry no version field.
    pub version_supported: bool,
}

impl ClassifiedDatagram {
    pub fn datagram_len(&self) -> usize {
        self.payload.len()
    }
}

/// Classify one datagram. Short-header DCID extraction assumes the
/// server's fixed 20-byte CID length.
pub fn classify(peer: PeerAddr, mut payload: Vec<u8>) -> Result<ClassifiedDatagram, DropReason> {
    let hdr = quiche::Header::from_slice(&mut payload, LOCAL_CID_LEN)
        .map_err(|_| DropReason::MalformedPacket)?;

    let kind = PacketKind::from(hdr.ty);
    let version_supported = match kind {
        PacketKind::Short => true,
        _ => quiche::version_is_supported(hdr.version),
    };

    let scid = hdr.scid.to_vec();
    let dcid = hdr.dcid.to_vec();
    let token = hdr.token;

    Ok(ClassifiedDatagram {
        peer,
        payload,
        scid,
        dcid,
        token,
        version: hdr.version,
        kind,
        version_supported,
    })
}
