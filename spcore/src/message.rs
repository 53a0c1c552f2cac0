use bytes::{BufMut, Bytes, BytesMut};

/// A logical SP datagram: a header region and a body region, independently sized and
///  mutable. Protocols prepend routing data to the header; transports frame
///  header + body as one unit on the wire.
///
/// Ownership replaces the refcount of classic C implementations: a message is a plain
///  owned value held by at most one AIO or queue at a time, and `dup` produces a deep
///  copy where a second owner is genuinely needed.
#[derive(Default)]
pub struct Message {
    header: BytesMut,
    body: BytesMut,
}

impl Message {
    pub fn new() -> Message {
        Message::default()
    }

    /// A message with a body of `len` zero bytes, ready to be filled by a receiver.
    pub fn with_body_len(len: usize) -> Message {
        let mut body = BytesMut::with_capacity(len);
        body.resize(len, 0);
        Message {
            header: BytesMut::new(),
            body,
        }
    }

    pub fn from_body(body: &[u8]) -> Message {
        Message {
            header: BytesMut::new(),
            body: BytesMut::from(body),
        }
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn header_mut(&mut self) -> &mut BytesMut {
        &mut self.header
    }

    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    pub fn header_len(&self) -> usize {
        self.header.len()
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Total wire length: header plus body.
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append_header(&mut self, data: &[u8]) {
        self.header.put_slice(data);
    }

    pub fn append_body(&mut self, data: &[u8]) {
        self.body.put_slice(data);
    }

    /// Prepend to the body; used by protocols that push routing data in front.
    pub fn insert_body(&mut self, data: &[u8]) {
        let mut nb = BytesMut::with_capacity(data.len() + self.body.len());
        nb.put_slice(data);
        nb.put_slice(&self.body);
        self.body = nb;
    }

    /// Remove and return the first `n` bytes of the body, or None if it is shorter.
    pub fn trim_body(&mut self, n: usize) -> Option<Bytes> {
        if self.body.len() < n {
            return None;
        }
        Some(self.body.split_to(n).freeze())
    }

    /// Remove and return the last `n` bytes of the body, or None if it is shorter.
    pub fn chop_body(&mut self, n: usize) -> Option<Bytes> {
        if self.body.len() < n {
            return None;
        }
        Some(self.body.split_off(self.body.len() - n).freeze())
    }

    pub fn clear(&mut self) {
        self.header.clear();
        self.body.clear();
    }

    pub fn clear_header(&mut self) {
        self.header.clear();
    }

    /// Deep copy.
    pub fn dup(&self) -> Message {
        Message {
            header: BytesMut::from(&self.header[..]),
            body: BytesMut::from(&self.body[..]),
        }
    }

    /// Consume the message into its frozen regions, for zero-copy transmission.
    pub fn into_parts(self) -> (Bytes, Bytes) {
        (self.header.freeze(), self.body.freeze())
    }

    /// Replace the body buffer wholesale; used by receivers that filled a buffer
    ///  directly off the wire.
    pub fn set_body(&mut self, body: BytesMut) {
        self.body = body;
    }

    /// Take the body buffer out, leaving the message body empty.
    pub fn take_body(&mut self) -> BytesMut {
        std::mem::take(&mut self.body)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Message[header={}B, body={}B]",
            self.header.len(),
            self.body.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_regions_are_independent() {
        let mut m = Message::new();
        m.append_header(&[1, 2]);
        m.append_body(&[3, 4, 5]);
        assert_eq!(m.header(), &[1, 2]);
        assert_eq!(m.body(), &[3, 4, 5]);
        assert_eq!(m.len(), 5);

        m.clear_header();
        assert_eq!(m.header_len(), 0);
        assert_eq!(m.body(), &[3, 4, 5]);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(4096)]
    fn test_with_body_len(#[case] len: usize) {
        let m = Message::with_body_len(len);
        assert_eq!(m.body_len(), len);
        assert!(m.body().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_trim_chop() {
        let mut m = Message::from_body(&[1, 2, 3, 4, 5]);
        assert_eq!(m.trim_body(2).unwrap().as_ref(), &[1, 2]);
        assert_eq!(m.chop_body(2).unwrap().as_ref(), &[4, 5]);
        assert_eq!(m.body(), &[3]);
        assert!(m.trim_body(2).is_none());
    }

    #[test]
    fn test_insert_body() {
        let mut m = Message::from_body(&[3, 4]);
        m.insert_body(&[1, 2]);
        assert_eq!(m.body(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_dup_is_deep() {
        let mut a = Message::from_body(b"abc");
        a.append_header(b"h");
        let b = a.dup();
        a.body_mut()[0] = b'x';
        assert_eq!(b.body(), b"abc");
        assert_eq!(b.header(), b"h");
    }

    #[test]
    fn test_into_parts() {
        let mut m = Message::from_body(b"body");
        m.append_header(b"hd");
        let (h, b) = m.into_parts();
        assert_eq!(h.as_ref(), b"hd");
        assert_eq!(b.as_ref(), b"body");
    }
}
