//! Parse Kubernetes resource Quantity strings into plain numbers so objective
//! targets can be compared against collector samples.

/// Parse a quantity string ("8", "8.5", "500m", "4Gi", "100M") to f64 in the
/// metric's base unit (cores, bytes, or a bare number).
pub fn parse_quantity(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(m) = s.strip_suffix('m') {
        return m.parse::<f64>().ok().map(|n| n / 1000.0);
    }

    // Binary suffixes
    for (suffix, factor) in [
        ("Ki", 1024f64),
        ("Mi", 1024f64 * 1024.0),
        ("Gi", 1024f64 * 1024.0 * 1024.0),
        ("Ti", 1024f64 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024f64 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ] {
        if let Some(n) = s.strip_suffix(suffix) {
            return n.parse::<f64>().ok().map(|v| v * factor);
        }
    }

    // Decimal suffixes
    for (suffix, factor) in [
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
    ] {
        if let Some(n) = s.strip_suffix(suffix) {
            return n.parse::<f64>().ok().map(|v| v * factor);
        }
    }

    s.parse::<f64>().ok()
}

/// Parse a CPU quantity string to cores ("500m" -> 0.5, "2" -> 2.0).
pub fn parse_cpu_cores(s: &str) -> Option<f64> {
    parse_quantity(s)
}

const EPSILON: f64 = 1e-9;

/// Float comparison with a fixed tolerance.
pub fn almost_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= EPSILON
}

/* ============================= TESTS ============================= */
