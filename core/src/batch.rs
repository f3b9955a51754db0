use crate::record::ChangeRecord;
use crate::watermark::Watermark;

/// An ordered group of records handed to the sink in one write.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    records: Vec<ChangeRecord>,
    /// Highest `updated_at` seen in the extraction up to and including this
    /// batch. Becomes eligible for persistence once the batch is loaded.
    high_water: Option<Watermark>,
}

impl Batch {
    pub fn new(records: Vec<ChangeRecord>, high_water: Option<Watermark>) -> Self {
        Self {
            records,
            high_water,
        }
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn high_water(&self) -> Option<Watermark> {
        self.high_water
    }
}

/// Groups an ordered record stream into batches of at most `batch_size`.
#[derive(Debug)]
pub struct BatchAccumulator {
    batch_size: usize,
    buffer: Vec<ChangeRecord>,
    high_water: Option<Watermark>,
}

impl BatchAccumulator {
    /// `batch_size` is clamped to at least one record.
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            high_water: None,
        }
    }

    /// Buffers `record`, returning a full batch once the threshold is reached.
    pub fn accept(&mut self, record: ChangeRecord) -> Option<Batch> {
        let observed = record.watermark();
        match self.high_water {
            Some(current) if observed <= current => {}
            _ => self.high_water = Some(observed),
        }

        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            Some(self.take())
        } else {
            None
        }
    }

    /// Returns the trailing partial batch, if anything is buffered.
    pub fn flush_remainder(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    pub fn high_water(&self) -> Option<Watermark> {
        self.high_water
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn take(&mut self) -> Batch {
        let records = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        Batch::new(records, self.high_water)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TransactionAttributes;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn record(id: u64, offset_secs: i64) -> ChangeRecord {
        let at = base() + Duration::seconds(offset_secs);
        ChangeRecord {
            id,
            attributes: TransactionAttributes {
                customer_id: 1,
                last_status: "DELETED".to_string(),
                pos_origin: "A".to_string(),
                pos_destination: "B".to_string(),
            },
            created_at: base(),
            updated_at: at,
            deleted_at: Some(at),
        }
    }

    #[test]
    fn test_emits_full_batches_and_remainder() {
        let mut acc = BatchAccumulator::new(5000);
        let mut sizes = Vec::new();

        for i in 0..12_000u64 {
            if let Some(batch) = acc.accept(record(i, i as i64)) {
                sizes.push(batch.len());
            }
        }
        let remainder = acc.flush_remainder().unwrap();
        sizes.push(remainder.len());

        assert_eq!(sizes, vec![5000, 5000, 2000]);
        assert_eq!(
            remainder.high_water(),
            Some(Watermark::new(base() + Duration::seconds(11_999)))
        );
        assert!(acc.flush_remainder().is_none());
    }

    #[test]
    fn test_high_water_is_running_maximum() {
        let mut acc = BatchAccumulator::new(2);

        assert!(acc.accept(record(1, 10)).is_none());
        let first = acc.accept(record(2, 20)).unwrap();
        assert_eq!(
            first.high_water(),
            Some(Watermark::new(base() + Duration::seconds(20)))
        );

        // Ties keep the previous value.
        assert!(acc.accept(record(3, 20)).is_none());
        assert_eq!(
            acc.high_water(),
            Some(Watermark::new(base() + Duration::seconds(20)))
        );

        let second = acc.accept(record(4, 30)).unwrap();
        assert_eq!(second.records()[0].id, 3);
        assert_eq!(
            second.high_water(),
            Some(Watermark::new(base() + Duration::seconds(30)))
        );
    }

    #[test]
    fn test_empty_accumulator_has_no_remainder() {
        let mut acc = BatchAccumulator::new(10);
        assert!(acc.flush_remainder().is_none());
        assert_eq!(acc.high_water(), None);
        assert_eq!(acc.buffered(), 0);
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let mut acc = BatchAccumulator::new(0);
        assert_eq!(acc.accept(record(1, 1)).map(|b| b.len()), Some(1));
    }
}
