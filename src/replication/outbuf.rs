//! Outgoing data message buffer
//!
//! Data messages are assembled in place: an 8-byte transaction version, then
//! `varint length + entry` per entry, then a resume marker (length 0 plus
//! the sender's local time). Finished messages stay in the buffer until
//! taken. When an entry does not fit, finished messages are moved out and
//! the buffer is replaced by one at least twice as large holding only the
//! in-progress message.

use crate::audit::{varint_len, write_varint};

const MIN_CAPACITY: usize = 64;

/// Reusable buffer for outgoing data messages
#[derive(Debug)]
pub struct OutgoingBuffer {
    buffer: Vec<u8>,
    position: usize,
    /// Start of the in-progress message
    message_start: usize,
    in_progress: bool,
    entries: usize,
    /// Finished messages still inside `buffer`
    finished: Vec<(usize, usize)>,
    /// Finished messages moved out by a reallocation
    spilled: Vec<Vec<u8>>,
}

impl OutgoingBuffer {
    /// Buffer with room for `capacity` bytes before its first reallocation
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity.max(MIN_CAPACITY)],
            position: 0,
            message_start: 0,
            in_progress: false,
            entries: 0,
            finished: Vec::new(),
            spilled: Vec::new(),
        }
    }

    /// Current allocation size
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// True while a message is being assembled
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Entries in the in-progress message
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Begin a message for a transaction version
    pub fn begin(&mut self, version: f64) {
        if self.in_progress {
            self.finish(None);
        }
        self.message_start = self.position;
        self.in_progress = true;
        self.entries = 0;
        self.write(&version.to_be_bytes());
    }

    /// Append one entry to the in-progress message
    pub fn push_entry(&mut self, entry: &[u8]) {
        let length = entry.len() as u32;
        self.ensure(varint_len(length) + entry.len());
        let mut prefix = Vec::with_capacity(5);
        write_varint(&mut prefix, length);
        self.write(&prefix);
        self.write(entry);
        self.entries += 1;
    }

    /// Close the in-progress message, with a resume marker when `resume_time`
    /// is given
    pub fn finish(&mut self, resume_time: Option<f64>) {
        if !self.in_progress {
            return;
        }
        if let Some(time) = resume_time {
            self.write(&[0]);
            self.write(&time.to_be_bytes());
        }
        self.finished.push((self.message_start, self.position));
        self.message_start = self.position;
        self.in_progress = false;
        self.entries = 0;
    }

    /// Take every finished message
    pub fn take_finished(&mut self) -> Vec<Vec<u8>> {
        let mut messages = std::mem::take(&mut self.spilled);
        for (start, end) in self.finished.drain(..) {
            messages.push(self.buffer[start..end].to_vec());
        }
        if !self.in_progress {
            self.position = 0;
            self.message_start = 0;
        }
        messages
    }

    fn write(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
    }

    fn ensure(&mut self, additional: usize) {
        if self.position + additional <= self.buffer.len() {
            return;
        }
        for (start, end) in self.finished.drain(..) {
            self.spilled.push(self.buffer[start..end].to_vec());
        }
        let tail = if self.in_progress {
            &self.buffer[self.message_start..self.position]
        } else {
            &[][..]
        };
        let mut capacity = self.buffer.len() * 2;
        while capacity < tail.len() + additional {
            capacity *= 2;
        }
        let mut grown = vec![0; capacity];
        grown[..tail.len()].copy_from_slice(tail);
        self.position = tail.len();
        self.message_start = 0;
        self.buffer = grown;
    }
}

impl Default for OutgoingBuffer {
    fn default() -> Self {
        Self::with_capacity(16 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::protocol::{decode_message, ProtocolMessage};

    fn data(bytes: &[u8]) -> (f64, Vec<Vec<u8>>, Option<f64>) {
        match decode_message(bytes).unwrap() {
            ProtocolMessage::Data(batch) => (batch.version, batch.entries, batch.resume_time),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_single_message() {
        let mut buffer = OutgoingBuffer::with_capacity(128);
        buffer.begin(1_700_000_000_000.0);
        buffer.push_entry(b"one");
        buffer.push_entry(b"two");
        buffer.finish(Some(1_700_000_000_500.0));
        let messages = buffer.take_finished();
        assert_eq!(messages.len(), 1);
        let (version, entries, resume) = data(&messages[0]);
        assert_eq!(version, 1_700_000_000_000.0);
        assert_eq!(entries, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(resume, Some(1_700_000_000_500.0));
    }

    #[test]
    fn test_growth_keeps_finished_and_in_progress_messages() {
        let mut buffer = OutgoingBuffer::with_capacity(MIN_CAPACITY);
        buffer.begin(1.0e12);
        buffer.push_entry(&[7u8; 20]);
        buffer.finish(None);

        buffer.begin(2.0e12);
        let big = vec![9u8; 300];
        buffer.push_entry(&[1u8; 10]);
        buffer.push_entry(&big);
        buffer.finish(Some(3.0e12));

        // Doubling from 64 until the 300-byte entry fits.
        assert_eq!(buffer.capacity(), 512);
        let messages = buffer.take_finished();
        assert_eq!(messages.len(), 2);
        assert_eq!(data(&messages[0]).1, vec![vec![7u8; 20]]);
        let (version, entries, resume) = data(&messages[1]);
        assert_eq!(version, 2.0e12);
        assert_eq!(entries, vec![vec![1u8; 10], big]);
        assert_eq!(resume, Some(3.0e12));
    }

    #[test]
    fn test_begin_closes_previous_message() {
        let mut buffer = OutgoingBuffer::default();
        buffer.begin(1.0e12);
        buffer.push_entry(b"a");
        buffer.begin(2.0e12);
        assert!(buffer.in_progress());
        assert_eq!(buffer.entry_count(), 0);
        buffer.finish(None);
        assert_eq!(buffer.take_finished().len(), 2);
    }
}
