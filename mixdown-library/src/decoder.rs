//! Streaming decode - a [`Source`] that decodes packets on demand

use crate::loader::{LoadError, Probed};
use mixdown_audio::{Source, SourceError, SourceRead};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::Decoder;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatReader, SeekMode, SeekTo};

/// Decodes a file or in-memory stream packet by packet.
///
/// Only one packet of PCM is held at a time. The packet buffer grows when a
/// larger packet arrives, so reads allocate only until the largest packet has
/// been seen. Timestamps are taken to be in frames, which holds for the
/// PCM, FLAC, Vorbis, MP3 and AAC readers.
pub struct DecodedSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: usize,
    sample_rate: u32,
    frame_count: Option<u64>,
    /// Last decoded packet, interleaved
    packet: Option<SampleBuffer<f32>>,
    packet_frames: usize,
    packet_cursor: usize,
    /// Frames to drop after an accurate seek landed early
    skip: u64,
    position: u64,
    exhausted: bool,
}

impl DecodedSource {
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        Ok(Self::from_probed(Probed::open(path)?))
    }

    pub fn from_memory(bytes: Vec<u8>) -> Result<Self, LoadError> {
        Ok(Self::from_probed(Probed::from_memory(bytes)?))
    }

    fn from_probed(probed: Probed) -> Self {
        Self {
            format: probed.format,
            decoder: probed.decoder,
            track_id: probed.track_id,
            channels: probed.channels,
            sample_rate: probed.sample_rate,
            frame_count: probed.frame_count,
            packet: None,
            packet_frames: 0,
            packet_cursor: 0,
            skip: 0,
            position: 0,
            exhausted: false,
        }
    }

    /// Decode the next packet of our track; false once the stream ends
    fn next_packet(&mut self) -> Result<bool, SourceError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(SourceError::Decode(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // Corrupt packet, carry on with the next one
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(SourceError::Decode(e.to_string())),
            };

            if self
                .packet
                .as_ref()
                .map_or(true, |buf| buf.capacity() < decoded.capacity())
            {
                self.packet = Some(SampleBuffer::<f32>::new(
                    decoded.capacity() as u64,
                    *decoded.spec(),
                ));
            }
            let Some(buf) = self.packet.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            self.packet_frames = buf.samples().len() / self.channels;
            self.packet_cursor = 0;

            if self.skip > 0 {
                let dropped = self.skip.min(self.packet_frames as u64);
                self.packet_cursor = dropped as usize;
                self.skip -= dropped;
            }
            if self.packet_cursor < self.packet_frames {
                return Ok(true);
            }
        }
    }

    fn clear_packet(&mut self) {
        self.packet_frames = 0;
        self.packet_cursor = 0;
    }
}

impl Source for DecodedSource {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, output: &mut [f32], frames: usize) -> Result<SourceRead, SourceError> {
        let ch = self.channels;
        let frames = frames.min(output.len() / ch);
        let mut written = 0;

        while written < frames {
            if self.packet_cursor >= self.packet_frames {
                if self.exhausted || !self.next_packet()? {
                    self.exhausted = true;
                    break;
                }
            }

            let Some(buf) = self.packet.as_ref() else {
                break;
            };
            let count = (frames - written).min(self.packet_frames - self.packet_cursor);
            let src = &buf.samples()[self.packet_cursor * ch..(self.packet_cursor + count) * ch];
            output[written * ch..(written + count) * ch].copy_from_slice(src);

            self.packet_cursor += count;
            written += count;
        }

        self.position += written as u64;
        let at_end = self.exhausted
            || self.frame_count.is_some_and(|len| self.position >= len);
        Ok(SourceRead {
            frames: written,
            at_end,
        })
    }

    fn seek(&mut self, frame: u64) -> Result<(), SourceError> {
        if let Some(len) = self.frame_count {
            if frame > len {
                return Err(SourceError::SeekOutOfRange { frame, len });
            }
            if frame == len {
                self.clear_packet();
                self.skip = 0;
                self.position = len;
                self.exhausted = true;
                return Ok(());
            }
        }

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: frame,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| SourceError::Decode(format!("seek to frame {frame} failed: {e}")))?;

        self.decoder.reset();
        self.clear_packet();
        self.skip = seeked.required_ts.saturating_sub(seeked.actual_ts);
        self.position = frame;
        self.exhausted = false;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn frame_count(&self) -> Option<u64> {
        self.frame_count
    }
}
