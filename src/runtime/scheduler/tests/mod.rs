//! Scheduler 单元测试
//!
//! 测试调度器配置、统计与工作线程状态


use crate::runtime::scheduler::{SchedulerConfig, SchedulerStats, WorkerState};
use std::time::Duration;

#[cfg(test)]
mod scheduler_config_tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert!(config.num_workers >= 1);
        assert_eq!(config.thread_name_prefix, "flow-worker");
        assert_eq!(config.stack_size, None);
        assert_eq!(config.parallel_for_chunks_per_worker, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_workers() {
        let config = SchedulerConfig::with_workers(3);
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.thread_name_prefix, "flow-worker");
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(SchedulerConfig::with_workers(0).validate().is_err());

        let config = SchedulerConfig {
            parallel_for_chunks_per_worker: 0,
            ..SchedulerConfig::with_workers(2)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: SchedulerConfig = toml::from_str("num_workers = 2").unwrap();
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.thread_name_prefix, "flow-worker");
        assert!(config.enable_stats);
    }
}

#[cfg(test)]
mod scheduler_stats_tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = SchedulerStats::default();
        stats.record_enqueued(3);
        stats.record_executed(Some(Duration::from_micros(40)), 0);
        stats.record_executed(None, 2);
        stats.record_slice();
        stats.record_run();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.nodes_enqueued, 3);
        assert_eq!(snapshot.nodes_executed, 2);
        assert_eq!(snapshot.tasks_failed, 2);
        assert_eq!(snapshot.slices_executed, 1);
        assert_eq!(snapshot.runs_completed, 1);
        assert_eq!(snapshot.total_exec_time_us, 40);
    }

    #[test]
    fn test_peak_parallelism_only_grows() {
        let stats = SchedulerStats::default();
        stats.update_parallelism(3);
        stats.update_parallelism(1);
        stats.update_parallelism(5);
        stats.update_parallelism(4);
        assert_eq!(stats.snapshot().peak_parallelism, 5);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = SchedulerStats::default();
        stats.record_run();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["runs_completed"], 1);
    }
}

#[cfg(test)]
mod worker_state_tests {
    use super::*;

    #[test]
    fn test_worker_state_roundtrip_u8() {
        for state in [
            WorkerState::Idle,
            WorkerState::WaitingOnQueue,
            WorkerState::RunningNode,
            WorkerState::Stopped,
        ] {
            assert_eq!(WorkerState::from_u8(state.as_u8()), state);
        }
    }
}
