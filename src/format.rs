//! Display formatting for run statistics.

use std::time::Duration;

/// `HH:MM:SS`, hours not wrapped at 24.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Round to a fixed number of decimals.
pub fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Distance in kilometers with one decimal, e.g. `5.2 km`.
pub fn format_km(distance_km: f64) -> String {
    format!("{:.1} km", round_to_decimals(distance_km, 1))
}

/// Speed with one decimal, e.g. `11.4 km/h`.
pub fn format_kmh(speed_kmh: f64) -> String {
    format!("{:.1} km/h", round_to_decimals(speed_kmh, 1))
}

/// Average pace as `m:ss / km`, or `-` when it is undefined.
pub fn format_pace(duration: Duration, distance_km: f64) -> String {
    if duration.is_zero() || distance_km <= 0.0 {
        return "-".to_string();
    }
    let seconds_per_km = (duration.as_secs() as f64 / distance_km).round() as u64;
    format!("{}:{:02} / km", seconds_per_km / 60, seconds_per_km % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "00:00:00");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
        assert_eq!(format_duration(Duration::from_secs(100 * 3600)), "100:00:00");
    }

    #[test]
    fn test_format_pace() {
        assert_eq!(format_pace(Duration::ZERO, 5.0), "-");
        assert_eq!(format_pace(Duration::from_secs(600), 0.0), "-");
        // 25 min over 5 km = 5:00 / km
        assert_eq!(format_pace(Duration::from_secs(1_500), 5.0), "5:00 / km");
        // 26 min 15 s over 5 km = 5:15 / km
        assert_eq!(format_pace(Duration::from_secs(1_575), 5.0), "5:15 / km");
    }

    #[test]
    fn test_format_km() {
        assert_eq!(format_km(5.249), "5.2 km");
        assert_eq!(format_kmh(11.36), "11.4 km/h");
    }
}
