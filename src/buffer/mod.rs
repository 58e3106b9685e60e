//! Bounded, timestamped circular buffer for acquisition data.
//!
//! One buffer holds the last N samples of a single stream (video frames or
//! tool poses). A single producer appends under the internal mutex; any
//! number of readers snapshot items by UID or by time under the same mutex.
//! UIDs are strictly monotonic and never reused, so a reader that falls
//! behind gets an unambiguous "not available anymore" instead of silently
//! reading overwritten data.
//!
//! Temporal queries operate on filtered timestamps (see [`filter`]); the
//! interpolated variant reconstructs a pose between two stored samples with
//! slerp + linear interpolation.

mod filter;
mod item;

pub use filter::{TimestampFilter, DEFAULT_AVERAGED_ITEMS};
pub use item::{
    FieldMap, ImageFormat, ImageFrame, ImageOrientation, ImageType, ItemStatus, PixelType,
    StreamItem, StreamPayload,
};

use crate::error::ItemError;
use log::debug;
use parking_lot::Mutex;

/// Default number of items a buffer holds.
pub const DEFAULT_CAPACITY: usize = 30;

/// Default upper bound on the gap between two items that temporal
/// interpolation is willing to bridge, in seconds.
pub const DEFAULT_MAX_ALLOWED_TIME_DIFFERENCE_SEC: f64 = 0.5;

/// How to resolve a timestamp that falls between two stored items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalLookup {
    /// Only return an item whose timestamp matches exactly.
    Exact,
    /// Return the neighbor with the smaller time difference; ties go to the
    /// later item.
    Closest,
    /// Reconstruct a pose between the enclosing items (slerp + lerp).
    /// Image payloads fall back to the closest item.
    Interpolated,
}

struct BufferCore {
    name: String,
    capacity: usize,
    /// Ring slots; uid `u` lives at slot `(u - 1) % capacity`.
    slots: Vec<Option<StreamItem>>,
    /// Highest uid ever assigned; 0 means nothing was ever written.
    latest_uid: u64,
    /// Number of live items (≤ capacity; reset by clear()).
    num_items: usize,
    latest_unfiltered_ts: f64,
    latest_filtered_ts: f64,
    filter: TimestampFilter,
    image_format: Option<ImageFormat>,
    max_allowed_time_difference: f64,
    /// `global = local + offset`; applied to both timestamps on add.
    local_time_offset: f64,
}

impl BufferCore {
    fn oldest_uid(&self) -> u64 {
        self.latest_uid + 1 - self.num_items as u64
    }

    fn slot_of(&self, uid: u64) -> usize {
        ((uid - 1) % self.capacity as u64) as usize
    }

    fn item(&self, uid: u64) -> Result<&StreamItem, ItemError> {
        if self.num_items == 0 {
            return Err(ItemError::NotFound);
        }
        if uid < self.oldest_uid() {
            return Err(ItemError::NotAvailableAnymore);
        }
        if uid > self.latest_uid {
            return Err(ItemError::NotAvailableYet);
        }
        self.slots[self.slot_of(uid)]
            .as_ref()
            .ok_or(ItemError::NotFound)
    }

    /// Closest live uid by filtered timestamp; ties break toward the later
    /// item. Errors distinguish "too early" from "too late" from "empty".
    fn uid_from_time(&self, time: f64) -> Result<u64, ItemError> {
        if self.num_items == 0 {
            return Err(ItemError::NotFound);
        }
        let oldest = self.oldest_uid();
        let oldest_ts = self.item(oldest)?.filtered_ts;
        let latest_ts = self.item(self.latest_uid)?.filtered_ts;
        if time < oldest_ts {
            return Err(ItemError::NotAvailableAnymore);
        }
        if time > latest_ts {
            return Err(ItemError::NotAvailableYet);
        }

        // Binary search for the first item at or after `time`.
        let (mut lo, mut hi) = (oldest, self.latest_uid);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.item(mid)?.filtered_ts < time {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        if lo == oldest {
            return Ok(lo);
        }
        let after = self.item(lo)?.filtered_ts;
        let before = self.item(lo - 1)?.filtered_ts;
        // Tie (equal distance) resolves to the later item.
        if (after - time) <= (time - before) {
            Ok(lo)
        } else {
            Ok(lo - 1)
        }
    }

    /// Enclosing items for interpolation: prev.filtered_ts ≤ time ≤
    /// next.filtered_ts with prev and next adjacent.
    fn prev_next_from_time(&self, time: f64) -> Result<(&StreamItem, &StreamItem), ItemError> {
        let closest_uid = self.uid_from_time(time)?;
        let closest = self.item(closest_uid)?;
        if closest.filtered_ts <= time {
            if closest_uid == self.latest_uid {
                // time == latest (uid_from_time already rejected newer times)
                return Ok((closest, closest));
            }
            Ok((closest, self.item(closest_uid + 1)?))
        } else {
            if closest_uid == self.oldest_uid() {
                return Ok((closest, closest));
            }
            Ok((self.item(closest_uid - 1)?, closest))
        }
    }
}

/// Thread-safe timestamped circular buffer.
pub struct FrameBuffer {
    inner: Mutex<BufferCore>,
}

impl FrameBuffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BufferCore {
                name: name.into(),
                capacity: capacity.max(1),
                slots: std::iter::repeat_with(|| None).take(capacity.max(1)).collect(),
                latest_uid: 0,
                num_items: 0,
                latest_unfiltered_ts: f64::NEG_INFINITY,
                latest_filtered_ts: f64::NEG_INFINITY,
                filter: TimestampFilter::default(),
                image_format: None,
                max_allowed_time_difference: DEFAULT_MAX_ALLOWED_TIME_DIFFERENCE_SEC,
                local_time_offset: 0.0,
            }),
        }
    }

    /// Resize the ring, keeping the newest items that still fit.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), ItemError> {
        if capacity == 0 {
            return Err(ItemError::CapacityZero);
        }
        let mut core = self.inner.lock();
        let keep = core.num_items.min(capacity);
        let mut kept: Vec<StreamItem> = Vec::with_capacity(keep);
        for uid in (core.latest_uid + 1 - keep as u64)..=core.latest_uid {
            if let Ok(item) = core.item(uid) {
                kept.push(item.clone());
            }
        }
        core.capacity = capacity;
        core.slots = std::iter::repeat_with(|| None).take(capacity).collect();
        core.num_items = kept.len();
        for item in kept {
            let slot = core.slot_of(item.uid);
            core.slots[slot] = Some(item);
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn num_items(&self) -> usize {
        self.inner.lock().num_items
    }

    /// Window size of the timestamp filter.
    pub fn set_averaged_items_for_filtering(&self, n: usize) {
        self.inner.lock().filter.set_averaged_items(n);
    }

    pub fn set_max_allowed_time_difference(&self, seconds: f64) {
        self.inner.lock().max_allowed_time_difference = seconds;
    }

    /// Offset between this device's clock and the host clock
    /// (`global = local + offset`).
    pub fn set_local_time_offset(&self, seconds: f64) {
        self.inner.lock().local_time_offset = seconds;
    }

    pub fn local_time_offset(&self) -> f64 {
        self.inner.lock().local_time_offset
    }

    /// Pin the image format this buffer accepts. Adopted automatically from
    /// the first image if unset.
    pub fn set_image_format(&self, format: ImageFormat) {
        self.inner.lock().image_format = Some(format);
    }

    /// Append one sample.
    ///
    /// Rejects timestamp regressions and image-format mismatches. When
    /// `filtered_ts` is `None` it is derived from the least-squares filter
    /// once the filter window has filled, and equals the unfiltered value
    /// before that. Returns the assigned uid.
    pub fn add(
        &self,
        payload: StreamPayload,
        index: u64,
        unfiltered_ts: f64,
        filtered_ts: Option<f64>,
        status: ItemStatus,
        custom_fields: Option<FieldMap>,
    ) -> Result<u64, ItemError> {
        let mut core = self.inner.lock();
        if core.capacity == 0 {
            return Err(ItemError::CapacityZero);
        }

        let unfiltered_ts = unfiltered_ts + core.local_time_offset;
        if unfiltered_ts <= core.latest_unfiltered_ts {
            debug!(
                "{}: rejecting item at {:.6}s, not newer than {:.6}s",
                core.name, unfiltered_ts, core.latest_unfiltered_ts
            );
            return Err(ItemError::TimestampRegression);
        }

        if let StreamPayload::Image(ref frame) = payload {
            match core.image_format {
                None => core.image_format = Some(frame.format),
                Some(expected) if expected != frame.format => {
                    debug!(
                        "{}: rejecting frame, format {:?} does not match buffer format {:?}",
                        core.name, frame.format, expected
                    );
                    return Err(ItemError::InvalidFormat);
                }
                Some(_) => {}
            }
        }

        let filtered_ts = match filtered_ts {
            Some(ts) => ts + core.local_time_offset,
            None => core.filter.add(index, unfiltered_ts),
        };
        // Filtered timestamps must never regress; the estimate is clamped so
        // ordered lookups stay correct even when the fit undershoots.
        let filtered_ts = if core.num_items > 0 {
            filtered_ts.max(core.latest_filtered_ts)
        } else {
            filtered_ts
        };

        core.latest_uid += 1;
        let uid = core.latest_uid;
        let slot = core.slot_of(uid);
        core.slots[slot] = Some(StreamItem {
            uid,
            index,
            filtered_ts,
            unfiltered_ts,
            status,
            payload,
            custom_fields: custom_fields.unwrap_or_default(),
        });
        if core.num_items < core.capacity {
            core.num_items += 1;
        }
        core.latest_unfiltered_ts = unfiltered_ts;
        core.latest_filtered_ts = filtered_ts;
        Ok(uid)
    }

    pub fn oldest_uid(&self) -> Result<u64, ItemError> {
        let core = self.inner.lock();
        if core.num_items == 0 {
            return Err(ItemError::NotFound);
        }
        Ok(core.oldest_uid())
    }

    pub fn latest_uid(&self) -> Result<u64, ItemError> {
        let core = self.inner.lock();
        if core.num_items == 0 {
            return Err(ItemError::NotFound);
        }
        Ok(core.latest_uid)
    }

    pub fn item_from_uid(&self, uid: u64) -> Result<StreamItem, ItemError> {
        self.inner.lock().item(uid).cloned()
    }

    pub fn latest_item(&self) -> Result<StreamItem, ItemError> {
        let core = self.inner.lock();
        core.item(core.latest_uid).cloned()
    }

    pub fn oldest_item(&self) -> Result<StreamItem, ItemError> {
        let core = self.inner.lock();
        core.item(core.oldest_uid()).cloned()
    }

    pub fn timestamp_from_uid(&self, uid: u64) -> Result<f64, ItemError> {
        Ok(self.inner.lock().item(uid)?.filtered_ts)
    }

    pub fn index_from_uid(&self, uid: u64) -> Result<u64, ItemError> {
        Ok(self.inner.lock().item(uid)?.index)
    }

    pub fn oldest_timestamp(&self) -> Result<f64, ItemError> {
        let core = self.inner.lock();
        Ok(core.item(core.oldest_uid())?.filtered_ts)
    }

    pub fn latest_timestamp(&self) -> Result<f64, ItemError> {
        let core = self.inner.lock();
        Ok(core.item(core.latest_uid)?.filtered_ts)
    }

    pub fn latest_item_has_valid_video_data(&self) -> bool {
        let core = self.inner.lock();
        core.item(core.latest_uid)
            .map(|item| item.has_valid_video_data())
            .unwrap_or(false)
    }

    pub fn latest_item_has_valid_transform_data(&self) -> bool {
        let core = self.inner.lock();
        core.item(core.latest_uid)
            .map(|item| item.has_valid_transform_data())
            .unwrap_or(false)
    }

    /// Closest live uid for a filtered timestamp.
    pub fn uid_from_time(&self, time: f64) -> Result<u64, ItemError> {
        self.inner.lock().uid_from_time(time)
    }

    /// Resolve an item at `time` with the requested lookup mode.
    pub fn item_from_time(
        &self,
        time: f64,
        lookup: TemporalLookup,
    ) -> Result<StreamItem, ItemError> {
        let core = self.inner.lock();
        match lookup {
            TemporalLookup::Closest => core.item(core.uid_from_time(time)?).cloned(),
            TemporalLookup::Exact => {
                let item = core.item(core.uid_from_time(time)?)?;
                if item.filtered_ts == time {
                    Ok(item.clone())
                } else {
                    Err(ItemError::NotFound)
                }
            }
            TemporalLookup::Interpolated => {
                let (prev, next) = core.prev_next_from_time(time)?;
                if prev.uid == next.uid {
                    return Ok(prev.clone());
                }
                let gap = next.filtered_ts - prev.filtered_ts;
                if gap > core.max_allowed_time_difference {
                    debug!(
                        "{}: gap {:.3}s at {:.6}s exceeds {:.3}s, not interpolating",
                        core.name, gap, time, core.max_allowed_time_difference
                    );
                    return Err(ItemError::NonInterpolable);
                }

                let (prev_matrix, next_matrix) =
                    match (prev.payload.as_transform(), next.payload.as_transform()) {
                        (Some(a), Some(b)) => (a, b),
                        // Image streams are not interpolable; closest wins.
                        _ => {
                            let closer = if time - prev.filtered_ts <= next.filtered_ts - time {
                                prev
                            } else {
                                next
                            };
                            return Ok(closer.clone());
                        }
                    };

                let fraction = (time - prev.filtered_ts) / gap;
                let closer = if fraction <= 0.5 { prev } else { next };
                let mut item = closer.clone();
                item.payload =
                    StreamPayload::Transform(prev_matrix.interpolate(next_matrix, fraction));
                item.filtered_ts = time;
                item.unfiltered_ts =
                    prev.unfiltered_ts + (next.unfiltered_ts - prev.unfiltered_ts) * fraction;
                Ok(item)
            }
        }
    }

    /// Measured frame rate over the live window.
    ///
    /// With `ideal = false` this is elapsed-time based:
    /// `(count - 1) / (latest_ts - oldest_ts)`. With `ideal = true` the mean
    /// frame period is computed from consecutive producer-index differences
    /// (the device cadence, unaffected by host-side stalls); when
    /// `period_stdev_sec` is supplied, the period standard deviation is
    /// written there.
    pub fn frame_rate(
        &self,
        ideal: bool,
        mut period_stdev_sec: Option<&mut f64>,
    ) -> Result<f64, ItemError> {
        let core = self.inner.lock();
        if core.num_items < 2 {
            return Err(ItemError::NotFound);
        }
        let oldest = core.item(core.oldest_uid())?;
        let latest = core.item(core.latest_uid)?;

        if !ideal {
            let span = latest.filtered_ts - oldest.filtered_ts;
            if span <= 0.0 {
                return Err(ItemError::NotFound);
            }
            if let Some(out) = period_stdev_sec.take() {
                *out = 0.0;
            }
            return Ok((core.num_items as f64 - 1.0) / span);
        }

        let mut periods = Vec::with_capacity(core.num_items - 1);
        for uid in core.oldest_uid()..core.latest_uid {
            let a = core.item(uid)?;
            let b = core.item(uid + 1)?;
            let index_delta = b.index.saturating_sub(a.index).max(1) as f64;
            periods.push((b.filtered_ts - a.filtered_ts) / index_delta);
        }
        let mean = periods.iter().sum::<f64>() / periods.len() as f64;
        if mean <= 0.0 {
            return Err(ItemError::NotFound);
        }
        if let Some(out) = period_stdev_sec.take() {
            let variance =
                periods.iter().map(|p| (p - mean) * (p - mean)).sum::<f64>() / periods.len() as f64;
            *out = variance.sqrt();
        }
        Ok(1.0 / mean)
    }

    /// Drop all live items. UIDs keep counting from where they were, so
    /// stale readers still resolve to "not available anymore".
    pub fn clear(&self) {
        let mut core = self.inner.lock();
        for slot in core.slots.iter_mut() {
            *slot = None;
        }
        core.num_items = 0;
        core.latest_unfiltered_ts = f64::NEG_INFINITY;
        core.latest_filtered_ts = f64::NEG_INFINITY;
        core.filter.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{rotation_z, Matrix4x4, Quaternion};
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

    fn transform_at(angle: f64, translation: [f64; 3]) -> StreamPayload {
        let mut m = rotation_z(angle);
        m.set_translation(translation);
        StreamPayload::Transform(m)
    }

    fn add_pose(buffer: &FrameBuffer, index: u64, ts: f64, angle: f64) -> u64 {
        buffer
            .add(
                transform_at(angle, [0.0, 0.0, 0.0]),
                index,
                ts,
                Some(ts),
                ItemStatus::Ok,
                None,
            )
            .unwrap()
    }

    fn gray_frame(value: u8) -> ImageFrame {
        let format = ImageFormat {
            size: [4, 3, 1],
            pixel_type: PixelType::U8,
            components: 1,
            image_type: ImageType::BMode,
            orientation: ImageOrientation::Mf,
        };
        ImageFrame::new(format, vec![value; format.frame_bytes()])
    }

    #[test]
    fn test_uids_strictly_increase() {
        let buffer = FrameBuffer::with_capacity("test", 4);
        let mut last = 0;
        for i in 0..10u64 {
            let uid = add_pose(&buffer, i, i as f64, 0.0);
            assert!(uid > last);
            last = uid;
        }
    }

    #[test]
    fn test_timestamp_regression_rejected() {
        let buffer = FrameBuffer::with_capacity("test", 4);
        add_pose(&buffer, 0, 5.0, 0.0);
        let result = buffer.add(
            transform_at(0.0, [0.0; 3]),
            1,
            5.0,
            Some(5.0),
            ItemStatus::Ok,
            None,
        );
        assert_eq!(result, Err(ItemError::TimestampRegression));
        assert_eq!(buffer.num_items(), 1);
    }

    #[test]
    fn test_capacity_bound_and_eviction() {
        let buffer = FrameBuffer::with_capacity("test", 5);
        for i in 0..12u64 {
            add_pose(&buffer, i, i as f64, 0.0);
            assert!(buffer.num_items() <= 5);
        }
        assert_eq!(buffer.latest_uid().unwrap(), 12);
        assert_eq!(buffer.oldest_uid().unwrap(), 12 - 5 + 1);
        assert_eq!(
            buffer.item_from_uid(3),
            Err(ItemError::NotAvailableAnymore)
        );
        assert_eq!(buffer.item_from_uid(99), Err(ItemError::NotAvailableYet));
    }

    #[test]
    fn test_image_format_mismatch_rejected() {
        let buffer = FrameBuffer::with_capacity("video", 4);
        buffer
            .add(
                StreamPayload::Image(gray_frame(1)),
                0,
                1.0,
                Some(1.0),
                ItemStatus::Ok,
                None,
            )
            .unwrap();

        let mut other = gray_frame(2);
        other.format.size = [8, 8, 1];
        other.pixels = vec![2; other.format.frame_bytes()];
        let result = buffer.add(
            StreamPayload::Image(other),
            1,
            2.0,
            Some(2.0),
            ItemStatus::Ok,
            None,
        );
        assert_eq!(result, Err(ItemError::InvalidFormat));
    }

    #[test]
    fn test_payload_round_trip_by_uid() {
        let buffer = FrameBuffer::with_capacity("video", 4);
        let frame = gray_frame(42);
        let uid = buffer
            .add(
                StreamPayload::Image(frame.clone()),
                7,
                1.5,
                Some(1.5),
                ItemStatus::Ok,
                None,
            )
            .unwrap();
        let item = buffer.item_from_uid(uid).unwrap();
        assert_eq!(item.payload.as_image().unwrap().pixels, frame.pixels);
        assert_eq!(item.index, 7);
    }

    #[test]
    fn test_uid_from_time_window_errors() {
        let buffer = FrameBuffer::with_capacity("test", 8);
        assert_eq!(buffer.uid_from_time(1.0), Err(ItemError::NotFound));
        for i in 0..5u64 {
            add_pose(&buffer, i, 10.0 + i as f64, 0.0);
        }
        assert_eq!(buffer.uid_from_time(9.0), Err(ItemError::NotAvailableAnymore));
        assert_eq!(buffer.uid_from_time(15.0), Err(ItemError::NotAvailableYet));
        assert_eq!(buffer.uid_from_time(12.2).unwrap(), 3);
        // Tie between 11.0 and 12.0 resolves to the later item.
        assert_eq!(buffer.uid_from_time(11.5).unwrap(), 3);
    }

    #[test]
    fn test_exact_lookup() {
        let buffer = FrameBuffer::with_capacity("test", 8);
        add_pose(&buffer, 0, 1.0, 0.0);
        add_pose(&buffer, 1, 2.0, 0.0);
        assert!(buffer.item_from_time(2.0, TemporalLookup::Exact).is_ok());
        assert_eq!(
            buffer.item_from_time(1.5, TemporalLookup::Exact),
            Err(ItemError::NotFound)
        );
    }

    #[test]
    fn test_interpolation_identity_at_item_timestamp() {
        let buffer = FrameBuffer::with_capacity("tracker", 8);
        add_pose(&buffer, 0, 1.0, 0.0);
        let uid = add_pose(&buffer, 1, 1.1, FRAC_PI_4);
        add_pose(&buffer, 2, 1.2, FRAC_PI_2);

        let stored = buffer.item_from_uid(uid).unwrap();
        let looked_up = buffer
            .item_from_time(stored.filtered_ts, TemporalLookup::Interpolated)
            .unwrap();
        let qa = Quaternion::from_matrix(stored.payload.as_transform().unwrap());
        let qb = Quaternion::from_matrix(looked_up.payload.as_transform().unwrap());
        assert_relative_eq!(qa.dot(&qb).abs(), 1.0, epsilon = 1.0e-9);
    }

    #[test]
    fn test_interpolation_midpoint() {
        let buffer = FrameBuffer::with_capacity("tracker", 8);
        buffer
            .add(
                transform_at(0.0, [0.0, 0.0, 0.0]),
                0,
                1.0,
                Some(1.0),
                ItemStatus::Ok,
                None,
            )
            .unwrap();
        buffer
            .add(
                transform_at(FRAC_PI_2, [10.0, 0.0, 0.0]),
                1,
                1.2,
                Some(1.2),
                ItemStatus::Ok,
                None,
            )
            .unwrap();

        let item = buffer
            .item_from_time(1.1, TemporalLookup::Interpolated)
            .unwrap();
        let matrix = item.payload.as_transform().unwrap();
        let expected: Matrix4x4 = rotation_z(FRAC_PI_4);
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(matrix.get(i, j), expected.get(i, j), epsilon = 1.0e-9);
            }
        }
        assert_relative_eq!(matrix.translation()[0], 5.0, epsilon = 1.0e-9);
    }

    #[test]
    fn test_interpolation_rejects_long_gaps() {
        let buffer = FrameBuffer::with_capacity("tracker", 8);
        buffer.set_max_allowed_time_difference(0.5);
        add_pose(&buffer, 0, 1.0, 0.0);
        add_pose(&buffer, 1, 3.0, FRAC_PI_2);
        assert_eq!(
            buffer.item_from_time(2.0, TemporalLookup::Interpolated),
            Err(ItemError::NonInterpolable)
        );
    }

    #[test]
    fn test_frame_rate_wall_and_ideal() {
        let buffer = FrameBuffer::with_capacity("video", 16);
        // 10 Hz cadence, producer skips index 5..8 (dropped frames).
        let indices = [0u64, 1, 2, 3, 4, 9, 10];
        for &idx in indices.iter() {
            add_pose(&buffer, idx, idx as f64 * 0.1, 0.0);
        }
        // Wall-clock rate counts 7 items over 1.0s.
        let wall = buffer.frame_rate(false, None).unwrap();
        assert_relative_eq!(wall, 6.0 / 1.0, epsilon = 1.0e-9);
        // Ideal rate normalizes by index deltas: the device ran at 10 Hz.
        let mut stdev = f64::NAN;
        let ideal = buffer.frame_rate(true, Some(&mut stdev)).unwrap();
        assert_relative_eq!(ideal, 10.0, epsilon = 1.0e-9);
        assert_relative_eq!(stdev, 0.0, epsilon = 1.0e-9);
    }

    #[test]
    fn test_clear_keeps_uid_sequence() {
        let buffer = FrameBuffer::with_capacity("test", 4);
        add_pose(&buffer, 0, 1.0, 0.0);
        add_pose(&buffer, 1, 2.0, 0.0);
        buffer.clear();
        assert_eq!(buffer.num_items(), 0);
        assert_eq!(buffer.latest_uid(), Err(ItemError::NotFound));
        let uid = add_pose(&buffer, 2, 3.0, 0.0);
        assert_eq!(uid, 3);
    }

    #[test]
    fn test_local_time_offset_applied() {
        let buffer = FrameBuffer::with_capacity("tracker", 4);
        buffer.set_local_time_offset(100.0);
        let uid = add_pose(&buffer, 0, 1.0, 0.0);
        // add_pose supplies filtered == unfiltered, both get shifted
        let item = buffer.item_from_uid(uid).unwrap();
        assert_relative_eq!(item.unfiltered_ts, 101.0);
        assert_relative_eq!(item.filtered_ts, 101.0);
    }

    #[test]
    fn test_set_capacity_keeps_newest() {
        let buffer = FrameBuffer::with_capacity("test", 8);
        for i in 0..6u64 {
            add_pose(&buffer, i, i as f64, 0.0);
        }
        buffer.set_capacity(3).unwrap();
        assert_eq!(buffer.num_items(), 3);
        assert_eq!(buffer.oldest_uid().unwrap(), 4);
        assert_eq!(buffer.latest_uid().unwrap(), 6);
        assert!(buffer.item_from_uid(5).is_ok());
        assert_eq!(buffer.set_capacity(0), Err(ItemError::CapacityZero));
    }

    #[test]
    fn test_filtered_timestamp_derivation_before_window_fills() {
        let buffer = FrameBuffer::with_capacity("video", 64);
        let uid = buffer
            .add(
                transform_at(0.0, [0.0; 3]),
                0,
                7.0,
                None,
                ItemStatus::Ok,
                None,
            )
            .unwrap();
        // Fewer samples than the filter window: filtered == unfiltered.
        let item = buffer.item_from_uid(uid).unwrap();
        assert_relative_eq!(item.filtered_ts, 7.0);
    }

    #[test]
    fn test_validity_probes() {
        let buffer = FrameBuffer::with_capacity("video", 4);
        assert!(!buffer.latest_item_has_valid_video_data());
        buffer
            .add(
                StreamPayload::Image(gray_frame(9)),
                0,
                1.0,
                Some(1.0),
                ItemStatus::Ok,
                None,
            )
            .unwrap();
        assert!(buffer.latest_item_has_valid_video_data());
        assert!(!buffer.latest_item_has_valid_transform_data());
        buffer
            .add(
                transform_at(0.0, [0.0; 3]),
                1,
                2.0,
                Some(2.0),
                ItemStatus::Invalid,
                None,
            )
            .unwrap();
        assert!(!buffer.latest_item_has_valid_transform_data());
    }
}
