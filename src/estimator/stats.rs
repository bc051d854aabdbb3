/// Usage counters of a single estimator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EstimatorStats {
    pub estimation_transfers_to_device: u64,
    pub estimation_transfers_to_host: u64,
    pub maintenance_transfers_to_device: u64,
    pub maintenance_transfers_to_host: u64,
    pub maintenance_transfer_time_us: u64,
    pub optimization_transfers_to_device: u64,
    pub optimization_transfers_to_host: u64,
    pub nr_of_estimations: u64,
    pub nr_of_deletions: u64,
    pub nr_of_insertions: u64,
}

impl EstimatorStats {
    pub const COLUMNS: [&'static str; 10] = [
        "estimation_transfers_to_device",
        "estimation_transfers_to_host",
        "maintenance_transfers_to_device",
        "maintenance_transfers_to_host",
        "maintenance_transfer_time_us",
        "optimization_transfers_to_device",
        "optimization_transfers_to_host",
        "nr_of_estimations",
        "nr_of_deletions",
        "nr_of_insertions",
    ];

    pub fn as_row(&self) -> [u64; 10] {
        [
            self.estimation_transfers_to_device,
            self.estimation_transfers_to_host,
            self.maintenance_transfers_to_device,
            self.maintenance_transfers_to_host,
            self.maintenance_transfer_time_us,
            self.optimization_transfers_to_device,
            self.optimization_transfers_to_host,
            self.nr_of_estimations,
            self.nr_of_deletions,
            self.nr_of_insertions,
        ]
    }
}
