//! Angle math on the celestial sphere and the azimuth circle.

/// Signed shortest-arc delta between two azimuth readings, in degrees.
///
/// Positive = clockwise (increasing azimuth), negative = counter-clockwise.
/// The result is always in `(-180, 180]`, so readings that straddle the
/// 0/360 boundary (e.g. 359.5 -> 0.5) come out as a small step, never as a
/// near-full-circle span.
pub fn shortest_arc_deg(from_deg: f64, to_deg: f64) -> f64 {
    let mut diff = (to_deg - from_deg) % 360.0;
    if diff > 180.0 {
        diff -= 360.0;
    } else if diff <= -180.0 {
        diff += 360.0;
    }
    diff
}

/// Angular separation between two RA/Dec pointings, in degrees.
///
/// Spherical law of cosines with the cosine clamped to `[-1, 1]` so nearly
/// identical pointings don't produce NaN from rounding.
pub fn angular_distance_deg(ra1_deg: f64, dec1_deg: f64, ra2_deg: f64, dec2_deg: f64) -> f64 {
    let ra1 = ra1_deg.to_radians();
    let ra2 = ra2_deg.to_radians();
    let dec1 = dec1_deg.to_radians();
    let dec2 = dec2_deg.to_radians();

    let cos_angle = dec1.sin() * dec2.sin() + dec1.cos() * dec2.cos() * (ra1 - ra2).cos();
    cos_angle.clamp(-1.0, 1.0).acos().to_degrees()
}
