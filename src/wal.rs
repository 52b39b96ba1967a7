use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read one frame's payload. `None` on clean EOF, truncation or CRC mismatch.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if !read_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !read_or_eof(reader, &mut payload)? || !read_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only journal of storage mutations.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`. A torn or
/// corrupt tail (crash mid-write) ends replay; everything before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the journal at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync.
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the journal with `snapshot`: write a temp file, fsync, rename over.
    pub fn compact(&mut self, snapshot: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in snapshot {
                encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Every intact event in `path`. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(payload) = read_frame(&mut reader)? {
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Reservation, ReservationKind, Resource, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("allotter_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn reservation_saved() -> Event {
        Event::ReservationSaved(Reservation {
            id: Ulid::new(),
            request_id: Some(Ulid::new()),
            resource_id: Ulid::new(),
            slot: Span::new(1000, 2000),
            kind: ReservationKind::Value { value: "9501".into() },
        })
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            Event::ResourceSaved(Resource::new(Ulid::new(), "mcu")),
            reservation_saved(),
            Event::RequestRemoved { id: Ulid::new() },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 3);
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = reservation_saved();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            // Length prefix promising more bytes than follow.
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(&[1, 2, 3]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let first = reservation_saved();
        let second = reservation_saved();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_replaces_contents() {
        let path = tmp_path("compact.wal");
        let keep = reservation_saved();
        let mut wal = Wal::open(&path).unwrap();
        for _ in 0..5 {
            wal.append(&reservation_saved()).unwrap();
        }
        wal.compact(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let after = Event::ReservationRemoved { id: Ulid::new() };
        wal.append(&after).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, after]);
        assert!(!path.with_extension("wal.tmp").exists());
        let _ = fs::remove_file(&path);
    }
}
