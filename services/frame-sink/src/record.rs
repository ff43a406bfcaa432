//! Per-frame metadata appended to the stream.

use crate::config::{FrameConfig, StreamConfig};
use crate::frame::FrameKey;
use crate::stream::{EntryId, StreamEntry, StreamError};

/// Value of identifiers the sink does not know about
pub const UNSET: i64 = -1;

/// Metadata describing one published frame.
///
/// Field order on the wire is fixed:
/// `memcached sensor_id joint_key track_id start_time feedback_id width height gain roi`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    /// Cache key of the payload
    pub cache_key: FrameKey,
    pub sensor_id: String,
    pub joint_key: i64,
    pub track_id: i64,
    pub start_time: i64,
    pub feedback_id: i64,
    pub width: u32,
    pub height: u32,
    pub gain: f32,
    /// Region-of-interest descriptor
    pub roi: String,
}

impl MetadataRecord {
    /// Record for a frame of `width`x`height` stored under `cache_key`
    pub fn new(cache_key: FrameKey, width: u32, height: u32, frame: &FrameConfig) -> Self {
        Self {
            cache_key,
            sensor_id: frame.sensor_id.clone(),
            joint_key: UNSET,
            track_id: UNSET,
            start_time: UNSET,
            feedback_id: UNSET,
            width,
            height,
            gain: frame.gain,
            roi: frame.roi.clone(),
        }
    }

    /// Ordered `(name, value)` pairs
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("memcached", self.cache_key.to_string()),
            ("sensor_id", self.sensor_id.clone()),
            ("joint_key", self.joint_key.to_string()),
            ("track_id", self.track_id.to_string()),
            ("start_time", self.start_time.to_string()),
            ("feedback_id", self.feedback_id.to_string()),
            ("width", self.width.to_string()),
            ("height", self.height.to_string()),
            // Downstream consumers expect six fractional digits
            ("gain", format!("{:.6}", self.gain)),
            ("roi", self.roi.clone()),
        ]
    }

    /// Validated stream entry for this record
    pub fn to_entry(&self, stream: &StreamConfig) -> Result<StreamEntry, StreamError> {
        let id = if stream.use_key_as_entry_id {
            EntryId::Explicit(self.cache_key.to_string())
        } else {
            EntryId::Auto
        };

        self.fields()
            .into_iter()
            .fold(
                StreamEntry::builder(&stream.stream_key)
                    .max_len(stream.max_len, stream.approximate_trim)
                    .id(id),
                |builder, (name, value)| builder.field(name, value),
            )
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::create_test_config;

    #[test]
    fn test_field_order_and_sentinels() {
        let config = create_test_config();
        let record = MetadataRecord::new(FrameKey::from_millis(1_700_000_000_000), 64, 48, &config.frame);

        let names: Vec<&str> = record.fields().iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec![
                "memcached",
                "sensor_id",
                "joint_key",
                "track_id",
                "start_time",
                "feedback_id",
                "width",
                "height",
                "gain",
                "roi"
            ]
        );

        let fields = record.fields();
        assert_eq!(fields[0].1, "1700000000000");
        assert_eq!(fields[1].1, "Libcamera");
        assert!(fields[2..6].iter().all(|(_, v)| v == "-1"));
        assert_eq!(fields[8].1, "1.500000");
        assert_eq!(fields[9].1, "0,0,0,0");
    }

    #[test]
    fn test_entry_uses_key_as_id() {
        let config = create_test_config();
        let record = MetadataRecord::new(FrameKey::from_millis(42), 64, 48, &config.frame);
        let entry = record.to_entry(&config.stream).unwrap();

        assert_eq!(entry.stream(), "Bitmaps");
        assert_eq!(entry.id(), &EntryId::Explicit("42".to_string()));
        assert_eq!(entry.trim().max_len, 1000);
        assert!(entry.trim().approximate);
        assert_eq!(entry.field("memcached"), Some("42"));
        assert_eq!(entry.field("width"), Some("64"));
        assert_eq!(entry.field("height"), Some("48"));
    }

    #[test]
    fn test_entry_with_server_assigned_id() {
        let mut config = create_test_config();
        config.stream.use_key_as_entry_id = false;
        let record = MetadataRecord::new(FrameKey::from_millis(42), 64, 48, &config.frame);

        let entry = record.to_entry(&config.stream).unwrap();
        assert_eq!(entry.id(), &EntryId::Auto);
        assert_eq!(entry.field("memcached"), Some("42"));
    }

    #[test]
    fn test_untrusted_roi_is_rejected() {
        let mut config = create_test_config();
        config.frame.roi = "0,0,1,1\r\nDEL Bitmaps".to_string();
        let record = MetadataRecord::new(FrameKey::from_millis(42), 64, 48, &config.frame);

        assert!(matches!(
            record.to_entry(&config.stream),
            Err(StreamError::InvalidField { .. })
        ));
    }
}
