//! SLIP framing (RFC 1055) for OSC over TCP: frames are END-delimited
//! with byte stuffing for END and ESC occurring in the payload.

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Encode one frame. A leading END flushes any line noise on the far
/// side, the trailing END terminates the frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &byte in payload {
        match byte {
            END => {
                out.push(ESC);
                out.push(ESC_END);
            }
            ESC => {
                out.push(ESC);
                out.push(ESC_ESC);
            }
            other => out.push(other),
        }
    }
    out.push(END);
    out
}

/// Incremental decoder for a SLIP byte stream.
#[derive(Default)]
pub struct Decoder {
    frame: Vec<u8>,
    escaped: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes, invoking `on_frame` for every completed
    /// non-empty frame.
    pub fn feed(&mut self, data: &[u8], on_frame: &mut dyn FnMut(&[u8])) {
        for &byte in data {
            if self.escaped {
                self.escaped = false;
                match byte {
                    ESC_END => self.frame.push(END),
                    ESC_ESC => self.frame.push(ESC),
                    // protocol violation; keep the raw byte
                    other => self.frame.push(other),
                }
                continue;
            }
            match byte {
                END => {
                    if !self.frame.is_empty() {
                        on_frame(&self.frame);
                        self.frame.clear();
                    }
                }
                ESC => self.escaped = true,
                other => self.frame.push(other),
            }
        }
    }

    pub fn reset(&mut self) {
        self.frame.clear();
        self.escaped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &[u8]) -> Vec<Vec<u8>> {
        let mut decoder = Decoder::new();
        let mut frames = Vec::new();
        decoder.feed(data, &mut |f| frames.push(f.to_vec()));
        frames
    }

    #[test]
    fn test_roundtrip_plain() {
        let payload = b"/aoo/server/ping";
        let frames = decode_all(&encode(payload));
        assert_eq!(frames, vec![payload.to_vec()]);
    }

    #[test]
    fn test_roundtrip_special_bytes() {
        let payload = [0x01, END, 0x02, ESC, 0x03, END, END];
        let frames = decode_all(&encode(&payload));
        assert_eq!(frames, vec![payload.to_vec()]);
    }

    #[test]
    fn test_split_delivery() {
        let payload = [END, ESC, 0x42];
        let encoded = encode(&payload);
        let mut decoder = Decoder::new();
        let mut frames = Vec::new();
        // one byte at a time
        for byte in encoded {
            decoder.feed(&[byte], &mut |f| frames.push(f.to_vec()));
        }
        assert_eq!(frames, vec![payload.to_vec()]);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut data = encode(b"one");
        data.extend_from_slice(&encode(b"two"));
        let frames = decode_all(&data);
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
