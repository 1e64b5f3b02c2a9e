use rand::Rng;
use serde::Serialize;

/// One report in the ingestor's wire format.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub identificador: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitud: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitud: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_1: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_3: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_4: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_5: Option<f64>,
}

/// A simulated device wandering around a start point.
#[derive(Debug, Clone)]
pub struct Device {
    pub identifier: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Largest step per report, in degrees (roughly 110 m).
const MAX_STEP_DEG: f64 = 0.001;

impl Device {
    pub fn new(identifier: String, rng: &mut impl Rng) -> Self {
        Self {
            identifier,
            latitude: rng.gen_range(40.30..40.50),
            longitude: rng.gen_range(-3.80..-3.60),
        }
    }

    /// Moves the device one random step and produces its next report.
    /// With probability `missing_position` the coordinates are left out.
    pub fn next_report(&mut self, rng: &mut impl Rng, missing_position: f64) -> Report {
        self.latitude = (self.latitude + rng.gen_range(-MAX_STEP_DEG..MAX_STEP_DEG)).clamp(-90.0, 90.0);
        self.longitude = wrap_longitude(self.longitude + rng.gen_range(-MAX_STEP_DEG..MAX_STEP_DEG));

        let omit = rng.gen_bool(missing_position.clamp(0.0, 1.0));
        let mut sensor = |p: f64| rng.gen_bool(p).then(|| rng.gen_range(0.0..100.0));

        Report {
            identificador: self.identifier.clone(),
            latitud: (!omit).then_some(self.latitude),
            longitud: (!omit).then_some(self.longitude),
            sensor_1: sensor(1.0),
            sensor_2: sensor(0.9),
            sensor_3: sensor(0.5),
            sensor_4: sensor(0.2),
            sensor_5: sensor(0.1),
        }
    }
}

fn wrap_longitude(lon: f64) -> f64 {
    if lon > 180.0 {
        lon - 360.0
    } else if lon < -180.0 {
        lon + 360.0
    } else {
        lon
    }
}
