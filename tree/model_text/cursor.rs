/**
A `Cursor` is a position in a byte buffer that is read one line at a time. Every read is bounds checked and reports how far the cursor moved, so callers can hand the remaining bytes to a parser and then advance by the number of bytes it consumed.
*/
#[derive(Clone, Copy, Debug)]
pub struct Cursor<'a> {
	bytes: &'a [u8],
	offset: usize,
}

impl<'a> Cursor<'a> {
	pub fn new(bytes: &'a [u8]) -> Cursor<'a> {
		Cursor { bytes, offset: 0 }
	}

	/// The number of bytes before the cursor.
	pub fn offset(&self) -> usize {
		self.offset
	}

	pub fn is_at_end(&self) -> bool {
		self.offset >= self.bytes.len()
	}

	/// The bytes after the cursor.
	pub fn rest(&self) -> &'a [u8] {
		&self.bytes[self.offset..]
	}

	/// Move the cursor forward. Returns `None` without moving if that would go past the end of the buffer.
	pub fn advance(&mut self, n_bytes: usize) -> Option<()> {
		let offset = self.offset.checked_add(n_bytes)?;
		if offset > self.bytes.len() {
			return None;
		}
		self.offset = offset;
		Some(())
	}

	/// Return the next line without its terminator and move past it.
	pub fn next_line(&mut self) -> Option<&'a [u8]> {
		if self.is_at_end() {
			return None;
		}
		let (line, consumed) = split_line(self.rest());
		self.offset += consumed;
		Some(line)
	}

	/// Return the next line without moving.
	pub fn peek_line(&self) -> Option<&'a [u8]> {
		if self.is_at_end() {
			return None;
		}
		Some(split_line(self.rest()).0)
	}

	/// Move past any empty lines.
	pub fn skip_empty_lines(&mut self) {
		while let Some(line) = self.peek_line() {
			if !line.is_empty() {
				break;
			}
			self.next_line();
		}
	}
}

/// Split the first line off `bytes`. Returns the line without its terminator and the number of bytes it occupies including the terminator. Lines end with `\n`, `\r\n`, or `\r`.
pub fn split_line(bytes: &[u8]) -> (&[u8], usize) {
	match bytes.iter().position(|&b| b == b'\n' || b == b'\r') {
		None => (bytes, bytes.len()),
		Some(end) => {
			let terminator_len = if bytes[end] == b'\r' && bytes.get(end + 1) == Some(&b'\n') {
				2
			} else {
				1
			};
			(&bytes[..end], end + terminator_len)
		}
	}
}

#[test]
fn test_lines() {
	let mut cursor = Cursor::new(b"a=1\r\n\nb=2\rc");
	assert_eq!(cursor.next_line(), Some(&b"a=1"[..]));
	assert_eq!(cursor.offset(), 5);
	assert_eq!(cursor.peek_line(), Some(&b""[..]));
	cursor.skip_empty_lines();
	assert_eq!(cursor.next_line(), Some(&b"b=2"[..]));
	assert_eq!(cursor.next_line(), Some(&b"c"[..]));
	assert_eq!(cursor.next_line(), None);
	assert!(cursor.is_at_end());
}

#[test]
fn test_advance_is_bounds_checked() {
	let mut cursor = Cursor::new(b"abc");
	assert_eq!(cursor.advance(2), Some(()));
	assert_eq!(cursor.rest(), b"c");
	assert_eq!(cursor.advance(2), None);
	assert_eq!(cursor.offset(), 2);
	assert_eq!(cursor.advance(1), Some(()));
	assert!(cursor.is_at_end());
}
