use soilrepo_contracts::BBox;

const KM_PER_DEGREE_LAT: f64 = 111.32;

pub fn parse_bbox(raw: &str) -> Option<BBox> {
    let [west, south, east, north] = parse_floats::<4>(raw)?;
    Some(BBox {
        west,
        south,
        east,
        north,
    })
}

/// `lat,lon,r_km` turned into a degree box around the point.
///
/// Planar approximation: one degree of latitude is 111.32 km, a degree of longitude
/// shrinks with `cos(lat)` (floored at 0.1 so polar queries stay bounded).
pub fn parse_within(raw: &str) -> Option<BBox> {
    let [lat, lon, radius_km] = parse_floats::<3>(raw)?;
    if radius_km < 0.0 {
        return None;
    }
    Some(within_to_bbox(lat, lon, radius_km))
}

pub fn within_to_bbox(lat: f64, lon: f64, radius_km: f64) -> BBox {
    let dlat = radius_km / KM_PER_DEGREE_LAT;
    let dlon = radius_km / (KM_PER_DEGREE_LAT * lat.to_radians().cos().max(0.1));
    BBox {
        west: lon - dlon,
        south: lat - dlat,
        east: lon + dlon,
        north: lat + dlat,
    }
}

fn parse_floats<const N: usize>(raw: &str) -> Option<[f64; N]> {
    let mut out = [0.0; N];
    let mut parts = raw.split(',');
    for slot in out.iter_mut() {
        let value = parts.next()?.trim().parse::<f64>().ok()?;
        if !value.is_finite() {
            return None;
        }
        *slot = value;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}
