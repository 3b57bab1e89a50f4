use crate::model::{
    CategoryCounts, ErrorCategory, Mean, MeanField, Means, OutcomeRecord, StatisticsNode, Tier,
};

/// Sum and sample count for one averaged metric.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SumAggregate {
    pub sum: f64,
    pub count: u64,
}

impl SumAggregate {
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count = self.count.saturating_add(1);
    }

    pub fn merge(&mut self, other: &SumAggregate) {
        self.sum += other.sum;
        self.count = self.count.saturating_add(other.count);
    }

    pub fn mean(&self) -> Mean {
        if self.count == 0 {
            return Mean::default();
        }
        Mean {
            value: self.sum / self.count as f64,
            samples: self.count,
        }
    }
}

/// Running counters and sums for one key, held in memory between flushes.
///
/// Sums are never written to disk; [`Accumulator::to_node`] replaces them with means.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulator {
    pub total: u64,
    pub success: u64,
    pub full_success: u64,
    pub partial_success: u64,
    pub failed: u64,
    pub errors: CategoryCounts,
    pub sums: [SumAggregate; 8],
    pub assisted_tests: u64,
    pub total_assists: u64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one outcome. Non-success tiers count one error category, `Other` if none given.
    pub fn record(&mut self, record: &OutcomeRecord, category: Option<ErrorCategory>) {
        self.total = self.total.saturating_add(1);
        match record.tier() {
            Tier::Success => self.success = self.success.saturating_add(1),
            Tier::Partial => self.partial_success = self.partial_success.saturating_add(1),
            Tier::Failed => self.failed = self.failed.saturating_add(1),
        }
        if record.is_full_success() {
            self.full_success = self.full_success.saturating_add(1);
        }
        if record.tier() != Tier::Success {
            self.errors.increment(category.unwrap_or(ErrorCategory::Other));
        }

        for (slot, field) in self.sums.iter_mut().zip(MeanField::ALL) {
            if let Some(sample) = field.sample(record) {
                slot.add(sample);
            }
        }

        if record.assist_count > 0 {
            self.assisted_tests = self.assisted_tests.saturating_add(1);
            self.total_assists = self.total_assists.saturating_add(u64::from(record.assist_count));
        }
    }

    pub fn merge(&mut self, other: &Accumulator) {
        self.total = self.total.saturating_add(other.total);
        self.success = self.success.saturating_add(other.success);
        self.full_success = self.full_success.saturating_add(other.full_success);
        self.partial_success = self.partial_success.saturating_add(other.partial_success);
        self.failed = self.failed.saturating_add(other.failed);
        self.errors.add(&other.errors);
        for (slot, o) in self.sums.iter_mut().zip(other.sums.iter()) {
            slot.merge(o);
        }
        self.assisted_tests = self.assisted_tests.saturating_add(other.assisted_tests);
        self.total_assists = self.total_assists.saturating_add(other.total_assists);
    }

    /// Converts sums into means and derives every ratio.
    pub fn to_node(&self) -> StatisticsNode {
        let mut means = Means::default();
        for (slot, field) in self.sums.iter().zip(MeanField::ALL) {
            means.set(field, slot.mean());
        }

        let mut node = StatisticsNode {
            total: self.total,
            success: self.success,
            full_success: self.full_success,
            partial_success: self.partial_success,
            failed: self.failed,
            errors: self.errors,
            means,
            assisted_tests: self.assisted_tests,
            total_assists: self.total_assists,
            ..Default::default()
        };
        node.refresh_derived();
        node
    }

    /// Rebuilds sums from a stored node, so stored rows can be re-buffered.
    pub fn from_node(node: &StatisticsNode) -> Self {
        let mut sums = [SumAggregate::default(); 8];
        for (slot, field) in sums.iter_mut().zip(MeanField::ALL) {
            let mean = node.means.get(field);
            *slot = SumAggregate {
                sum: mean.value * mean.samples as f64,
                count: mean.samples,
            };
        }
        Self {
            total: node.total,
            success: node.success,
            full_success: node.full_success,
            partial_success: node.partial_success,
            failed: node.failed,
            errors: node.errors,
            sums,
            assisted_tests: node.assisted_tests,
            total_assists: node.total_assists,
        }
    }
}
