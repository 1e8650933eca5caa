//! Minimal HTTP/2 frame header scanning.
//!
//! Only frame types and flags are decoded; payloads are skipped. This is
//! enough to police PINGs and to notice outgoing HEADERS and DATA without
//! touching the HTTP/2 implementation.

/// The client connection preface that precedes the first frame.
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const HEADER_LEN: usize = 9;

pub(crate) const DATA: u8 = 0x0;
pub(crate) const HEADERS: u8 = 0x1;
pub(crate) const PING: u8 = 0x6;

pub(crate) const FLAG_ACK: u8 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub kind: u8,
    pub flags: u8,
    pub length: usize,
}

impl FrameHeader {
    /// A PING sent by the peer, not an acknowledgement of ours.
    pub(crate) fn is_ping_request(&self) -> bool {
        self.kind == PING && self.flags & FLAG_ACK == 0
    }
}

/// Incremental frame header parser for one direction of a connection.
#[derive(Debug)]
pub(crate) struct FrameScanner {
    preface_left: usize,
    header: [u8; HEADER_LEN],
    header_len: usize,
    payload_left: usize,
}

impl FrameScanner {
    /// Scanner for bytes sent by the client, which start with the preface.
    pub(crate) fn inbound() -> Self {
        Self::with_preface(PREFACE.len())
    }

    /// Scanner for bytes sent by the server.
    pub(crate) fn outbound() -> Self {
        Self::with_preface(0)
    }

    fn with_preface(preface_left: usize) -> Self {
        Self {
            preface_left,
            header: [0; HEADER_LEN],
            header_len: 0,
            payload_left: 0,
        }
    }

    /// Feed the next chunk of the byte stream; `on_frame` is called for every
    /// frame header completed by it.
    pub(crate) fn feed(&mut self, mut data: &[u8], mut on_frame: impl FnMut(FrameHeader)) {
        while !data.is_empty() {
            if self.preface_left > 0 {
                let skip = self.preface_left.min(data.len());
                self.preface_left -= skip;
                data = &data[skip..];
                continue;
            }

            if self.payload_left > 0 {
                let skip = self.payload_left.min(data.len());
                self.payload_left -= skip;
                data = &data[skip..];
                continue;
            }

            let take = (HEADER_LEN - self.header_len).min(data.len());
            self.header[self.header_len..self.header_len + take].copy_from_slice(&data[..take]);
            self.header_len += take;
            data = &data[take..];

            if self.header_len == HEADER_LEN {
                self.header_len = 0;
                let h = &self.header;
                let frame = FrameHeader {
                    length: u32::from_be_bytes([0, h[0], h[1], h[2]]) as usize,
                    kind: h[3],
                    flags: h[4],
                };
                self.payload_left = frame.length;
                on_frame(frame);
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn encode_frame(kind: u8, flags: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() as u32).to_be_bytes();
    let mut out = vec![len[1], len[2], len[3], kind, flags, 0, 0, 0, 0];
    out.extend_from_slice(payload);
    out
}
