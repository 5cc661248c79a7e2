//! Buckets used to summarize completed glideins.

pub const TIME_RANGES: [&str; 7] = [
    "Unknown", "Minutes", "30mins", "2hours", "8hours", "32hours", "Days",
];
pub const JOB_RANGES: [&str; 6] = ["None", "1job", "2jobs", "4jobs", "16jobs", "Many"];
pub const MILL_RANGES: [&str; 8] = ["None", "5m", "25m", "100m", "250m", "500m", "Most", "All"];

/// Logarithmic (base 4) bucket of a duration in seconds, starting at 7.5 minutes.
pub fn time_range(seconds: f64) -> String {
    if seconds < 1.0 {
        return "Unknown".to_string();
    }
    if seconds < 25.0 * 60.0 {
        return "Minutes".to_string();
    }
    if seconds > 64.0 * 3600.0 {
        return "Days".to_string();
    }
    let exponent = ((seconds / 450.0).log(4.0) + 0.49).trunc();
    let level = 4f64.powf(exponent) * 450.0;
    if level < 3600.0 {
        format!("{}mins", (level / 60.0 + 0.49) as i64)
    } else {
        format!("{}hours", (level / 3600.0 + 0.49) as i64)
    }
}

pub fn job_range(jobs: u64) -> &'static str {
    match jobs {
        0 => "None",
        1 => "1job",
        2 => "2jobs",
        3..=8 => "4jobs",
        9..=29 => "16jobs",
        _ => "Many",
    }
}

/// Bucket of a waste ratio in permille.
pub fn mill_range(permille: f64) -> &'static str {
    if permille < 2.0 {
        "None"
    } else if permille < 15.0 {
        "5m"
    } else if permille < 60.0 {
        "25m"
    } else if permille < 180.0 {
        "100m"
    } else if permille < 400.0 {
        "250m"
    } else if permille < 700.0 {
        "500m"
    } else if permille > 998.0 {
        "All"
    } else {
        "Most"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_ranges() {
        let ranges: Vec<String> = [0.5, 60.0, 1800.0, 3000.0, 7200.0, 30000.0, 100000.0, 300000.0]
            .into_iter()
            .map(time_range)
            .collect();
        assert_eq!(
            ranges,
            ["Unknown", "Minutes", "30mins", "30mins", "2hours", "8hours", "32hours", "Days"]
        );
        for seconds in (0..300_000).step_by(997) {
            assert!(TIME_RANGES.contains(&time_range(seconds as f64).as_str()));
        }
    }

    #[test]
    fn job_and_mill_ranges() {
        assert_eq!(job_range(0), "None");
        assert_eq!(job_range(5), "4jobs");
        assert_eq!(job_range(29), "16jobs");
        assert_eq!(job_range(30), "Many");
        assert_eq!(mill_range(1.0), "None");
        assert_eq!(mill_range(100.0), "100m");
        assert_eq!(mill_range(850.0), "Most");
        assert_eq!(mill_range(999.0), "All");
        assert_eq!(mill_range(1000.0), "All");
    }
}
