//! Runtime configuration surface (spec.md §6 "Configuration surface").
//!
//! `gmt-runtime` (the `clap` binary) builds a [`Config`] from flags; library
//! embedders can build one directly or load it from a `gmt.toml` via
//! [`Config::from_toml_str`]. [`Config::merge_env`] applies `GMT_*`
//! environment overrides the way `cli/src/nonosctl/daemon.rs`'s
//! `check_config_flag` layers a `toml` file under ad hoc env/flag reads —
//! here formalised as one explicit precedence: flag > env > file > default.

use serde::{Deserialize, Serialize};

use crate::error::{GmtError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub num_workers: u32,
    pub num_helpers: u32,
    pub num_uthreads_per_worker: u32,
    pub max_nesting: u32,
    pub comm_buffer_size: usize,
    pub num_cmd_blocks: u32,
    pub cmd_block_size: usize,
    pub num_buffs_per_channel: u32,
    pub mtasks_per_queue: u32,
    pub num_mtasks_queues: u32,
    pub mtasks_res_block_loc: u32,
    pub mtasks_res_block_rem: u32,
    pub max_handles_per_node: u32,
    pub handle_check_interval_ms: u64,
    pub mtask_check_interval_ms: u64,
    pub cmdb_check_interval_ms: u64,
    pub node_agg_check_interval_ms: u64,
    pub thread_pinning: bool,
    pub num_cores: u32,
    pub stride_pinning: u32,
    pub state_name: Option<String>,
    pub state_rw: bool,
    pub state_populate: bool,
    pub ssd_path: Option<String>,
    pub disk_path: Option<String>,
    pub release_uthread_stack: bool,
    pub limit_parallelism: bool,
    pub enable_usr_signal: bool,

    /// Cluster addresses in rank order, `node_id` is this process's index.
    /// Not in spec.md's table (that table is about per-node tunables) but
    /// needed to actually stand the cluster up; grounded on the `addresses`
    /// field of the `Cluster` config variant other example repos use for
    /// distributed process bring-up.
    pub addresses: Vec<String>,
    pub node_id: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_workers: 4,
            num_helpers: 2,
            num_uthreads_per_worker: 32,
            max_nesting: 4,
            comm_buffer_size: 256 * 1024,
            num_cmd_blocks: 64,
            cmd_block_size: 4096,
            num_buffs_per_channel: 8,
            mtasks_per_queue: 1024,
            num_mtasks_queues: 4,
            mtasks_res_block_loc: 16,
            mtasks_res_block_rem: 16,
            max_handles_per_node: 256,
            handle_check_interval_ms: 50,
            mtask_check_interval_ms: 5,
            cmdb_check_interval_ms: 5,
            node_agg_check_interval_ms: 5,
            thread_pinning: false,
            num_cores: 0,
            stride_pinning: 1,
            state_name: None,
            state_rw: false,
            state_populate: false,
            ssd_path: None,
            disk_path: None,
            release_uthread_stack: true,
            limit_parallelism: false,
            enable_usr_signal: false,
            addresses: vec!["127.0.0.1:17000".to_string()],
            node_id: 0,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Config> {
        toml::from_str(s).map_err(|e| GmtError::InvalidConfig(e.to_string()))
    }

    /// Apply `GMT_*` environment variable overrides on top of whatever is
    /// already set (file defaults, or [`Config::default`]).
    pub fn merge_env(mut self) -> Config {
        macro_rules! env_num {
            ($field:ident, $name:literal) => {
                if let Ok(v) = std::env::var($name) {
                    if let Ok(parsed) = v.parse() {
                        self.$field = parsed;
                    }
                }
            };
        }
        env_num!(num_workers, "GMT_NUM_WORKERS");
        env_num!(num_helpers, "GMT_NUM_HELPERS");
        env_num!(num_uthreads_per_worker, "GMT_NUM_UTHREADS_PER_WORKER");
        env_num!(max_nesting, "GMT_MAX_NESTING");
        env_num!(comm_buffer_size, "GMT_COMM_BUFFER_SIZE");
        env_num!(num_cmd_blocks, "GMT_NUM_CMD_BLOCKS");
        env_num!(cmd_block_size, "GMT_CMD_BLOCK_SIZE");
        env_num!(max_handles_per_node, "GMT_MAX_HANDLES_PER_NODE");
        env_num!(node_id, "GMT_NODE_ID");
        if let Ok(v) = std::env::var("GMT_ADDRESSES") {
            self.addresses = v.split(',').map(|s| s.to_string()).collect();
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(GmtError::InvalidConfig("num_workers must be >= 1".into()));
        }
        if self.num_cmd_blocks == 0 {
            return Err(GmtError::InvalidConfig(
                "num_cmd_blocks too small: need at least 1 per destination".into(),
            ));
        }
        if self.cmd_block_size < 64 || self.cmd_block_size > self.comm_buffer_size {
            return Err(GmtError::InvalidConfig(format!(
                "cmd_block_size {} must be >= 64 and <= comm_buffer_size {}",
                self.cmd_block_size, self.comm_buffer_size
            )));
        }
        // Handle ids are packed into the `node-local handle` bitfield; see
        // handle.rs HANDLE_ID_BITS. 2^20 is the ceiling the layout allows.
        if self.max_handles_per_node == 0 || self.max_handles_per_node > (1 << 20) {
            return Err(GmtError::InvalidConfig(
                "max_handles_per_node overflows the handle id bitfield".into(),
            ));
        }
        if self.node_id as usize >= self.addresses.len() {
            return Err(GmtError::InvalidConfig(format!(
                "node_id {} out of range for {} configured addresses",
                self.node_id,
                self.addresses.len()
            )));
        }
        Ok(())
    }

    pub fn num_nodes(&self) -> u32 {
        self.addresses.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_workers() {
        let mut cfg = Config::default();
        cfg.num_workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_cmd_block_larger_than_comm_buffer() {
        let mut cfg = Config::default();
        cfg.cmd_block_size = cfg.comm_buffer_size + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = Config::default();
        let s = toml::to_string(&cfg).unwrap();
        let back = Config::from_toml_str(&s).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("GMT_NUM_WORKERS", "7");
        let cfg = Config::default().merge_env();
        assert_eq!(cfg.num_workers, 7);
        std::env::remove_var("GMT_NUM_WORKERS");
    }
}
