use serde::{Deserialize, Serialize};

use crate::common::removal::RemovalMode;
use crate::frontend::config::RemovalConfig;

/// Removal a group asks for in its configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemovalType {
    #[serde(alias = "no")]
    No,
    #[serde(alias = "wait")]
    Wait,
    #[serde(alias = "idle")]
    Idle,
    #[serde(alias = "all")]
    All,
    /// Never ask for removal, not even automatically
    #[serde(alias = "disable")]
    Disable,
}

impl RemovalType {
    fn mode(&self) -> Option<RemovalMode> {
        match self {
            RemovalType::No => Some(RemovalMode::No),
            RemovalType::Wait => Some(RemovalMode::Wait),
            RemovalType::Idle => Some(RemovalMode::Idle),
            RemovalType::All => Some(RemovalMode::All),
            RemovalType::Disable => None,
        }
    }
}

const IDLE0_LIMIT: u32 = 5;
const GLIDEEMPTY_LIMIT: u32 = 10;
const GLIDETOTAL0_LIMIT: u32 = 10;

/// Consecutive iterations an entry has looked unneeded.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalCounters {
    /// No idle jobs
    pub idle0: u32,
    /// Every glidein idle
    pub glideempty: u32,
    /// No glideins at all
    pub glidetotal0: u32,
}

impl RemovalCounters {
    pub fn update(&mut self, idle_jobs: u64, slots_idle: u64, slots_total: u64) {
        if idle_jobs > 0 {
            *self = RemovalCounters::default();
            return;
        }
        self.idle0 += 1;
        if slots_idle >= slots_total {
            self.glideempty += 1;
        } else {
            self.glideempty = 0;
        }
        if slots_total == 0 {
            self.glidetotal0 += 1;
        } else {
            self.glidetotal0 = 0;
        }
    }

    pub fn automatic_mode(&self) -> RemovalMode {
        if self.idle0 <= IDLE0_LIMIT {
            RemovalMode::No
        } else if self.glideempty <= GLIDEEMPTY_LIMIT {
            RemovalMode::Wait
        } else if self.glidetotal0 <= GLIDETOTAL0_LIMIT {
            RemovalMode::Idle
        } else {
            RemovalMode::All
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RemovalRequest {
    pub mode: RemovalMode,
    pub margin: u32,
}

/// Combines the automatic mode of an entry with the configured removal.
pub fn decide_removal(counters: &RemovalCounters, config: &RemovalConfig) -> RemovalRequest {
    let automatic = counters.automatic_mode();
    let Some(configured) = config.removal_type else {
        return RemovalRequest {
            mode: automatic,
            margin: 0,
        };
    };
    let Some(configured) = configured.mode() else {
        return RemovalRequest::default();
    };
    if config.removal_requests_tracking {
        RemovalRequest {
            mode: automatic.max(configured),
            margin: config.removal_margin,
        }
    } else if counters.idle0 > config.removal_wait {
        RemovalRequest {
            mode: automatic.max(configured),
            margin: 0,
        }
    } else {
        RemovalRequest {
            mode: automatic,
            margin: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(counters: &mut RemovalCounters, n: usize, idle: u64, slots_idle: u64, total: u64) {
        for _ in 0..n {
            counters.update(idle, slots_idle, total);
        }
    }

    #[test]
    fn automatic_escalation() {
        let config = RemovalConfig::default();
        let mut counters = RemovalCounters::default();
        run(&mut counters, 5, 0, 1, 4);
        assert_eq!(decide_removal(&counters, &config).mode, RemovalMode::No);
        run(&mut counters, 1, 0, 1, 4);
        assert_eq!(decide_removal(&counters, &config).mode, RemovalMode::Wait);
        run(&mut counters, 11, 0, 4, 4);
        assert_eq!(decide_removal(&counters, &config).mode, RemovalMode::Idle);
        run(&mut counters, 11, 0, 0, 0);
        assert_eq!(decide_removal(&counters, &config).mode, RemovalMode::All);

        counters.update(3, 0, 0);
        assert_eq!(counters, RemovalCounters::default());
        assert_eq!(decide_removal(&counters, &config).mode, RemovalMode::No);
    }

    #[test]
    fn automatic_mode_is_monotone() {
        let mut previous = RemovalMode::No;
        for idle0 in 0..15 {
            for glideempty in 0..15 {
                for glidetotal0 in 0..15 {
                    let counters = RemovalCounters {
                        idle0,
                        glideempty,
                        glidetotal0,
                    };
                    let mode = counters.automatic_mode();
                    for bigger in [
                        RemovalCounters { idle0: idle0 + 1, ..counters },
                        RemovalCounters { glideempty: glideempty + 1, ..counters },
                        RemovalCounters { glidetotal0: glidetotal0 + 1, ..counters },
                    ] {
                        assert!(bigger.automatic_mode() >= mode);
                    }
                    previous = previous.max(mode);
                }
            }
        }
        assert_eq!(previous, RemovalMode::All);
    }

    #[test]
    fn configured_removal() {
        let counters = RemovalCounters {
            idle0: 3,
            ..Default::default()
        };
        let mut config = RemovalConfig {
            removal_type: Some(RemovalType::Idle),
            removal_wait: 5,
            removal_requests_tracking: false,
            removal_margin: 4,
        };
        assert_eq!(decide_removal(&counters, &config), RemovalRequest::default());

        config.removal_wait = 2;
        assert_eq!(
            decide_removal(&counters, &config),
            RemovalRequest {
                mode: RemovalMode::Idle,
                margin: 0
            }
        );

        config.removal_wait = 5;
        config.removal_requests_tracking = true;
        assert_eq!(
            decide_removal(&RemovalCounters::default(), &config),
            RemovalRequest {
                mode: RemovalMode::Idle,
                margin: 4
            }
        );
    }

    #[test]
    fn disable_suppresses_automatic_removal() {
        let counters = RemovalCounters {
            idle0: 20,
            glideempty: 20,
            glidetotal0: 20,
        };
        let config = RemovalConfig {
            removal_type: Some(RemovalType::Disable),
            ..Default::default()
        };
        assert_eq!(decide_removal(&counters, &config).mode, RemovalMode::No);
        let config = RemovalConfig {
            removal_type: Some(RemovalType::Wait),
            ..Default::default()
        };
        assert_eq!(decide_removal(&counters, &config).mode, RemovalMode::All);
    }
}
