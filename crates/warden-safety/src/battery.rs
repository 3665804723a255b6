//! Energy-based battery failsafe: decide whether the pack can still carry
//! the aircraft home, and what to do when it cannot.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, error, warn};

use warden_nav::geo::{haversine_m, GeoPoint};

#[derive(Debug, Clone, Deserialize)]
pub struct BatteryParams {
    pub capacity_mah: f64,
    pub nominal_voltage: f64,
    pub cells: u32,

    pub cruise_power_w: f64,
    pub climb_power_w: f64,
    pub cruise_speed_ms: f64,
    pub vertical_speed_ms: f64,

    /// Extra energy kept on top of the computed RTH requirement.
    pub reserve_fraction: f64,
    pub min_cell_voltage: f64,
}

impl Default for BatteryParams {
    fn default() -> Self {
        // 4S2P pack on the 1.4 m airframe
        Self {
            capacity_mah: 10_400.0,
            nominal_voltage: 14.8,
            cells: 4,
            cruise_power_w: 150.0,
            climb_power_w: 250.0,
            cruise_speed_ms: 15.0,
            vertical_speed_ms: 2.0,
            reserve_fraction: 0.20,
            min_cell_voltage: 3.3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatteryState {
    pub voltage: f64,
    pub current: f64,
    pub remaining_pct: i8,
    pub consumed_mah: f64,
}

impl BatteryState {
    pub fn cell_voltage(&self, cells: u32) -> f64 {
        if cells == 0 {
            0.0
        } else {
            self.voltage / cells as f64
        }
    }

    pub fn readable(&self) -> bool {
        self.voltage > 0.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlightState {
    pub position: GeoPoint,
    pub altitude_m: f64,
    pub ground_speed: f64,
    pub heading_deg: f64,
    pub home: GeoPoint,
    pub home_altitude_m: f64,
}

/// Outcome of one failsafe check, ordered by severity.
#[derive(Debug, Clone, PartialEq)]
pub enum FailsafeDecision {
    Ok { margin: f64 },
    Warn { margin: f64 },
    RthNow { margin: f64 },
    LandNow { reason: String },
}

impl FailsafeDecision {
    pub fn is_failsafe(&self) -> bool {
        matches!(self, FailsafeDecision::RthNow { .. } | FailsafeDecision::LandNow { .. })
    }
}

/// The physical power model.
pub struct EnergyModel {
    pub params: BatteryParams,
}

impl EnergyModel {
    pub fn new(params: BatteryParams) -> Self {
        Self { params }
    }

    /// Usable energy left in the pack, mAh. Takes the more pessimistic of a
    /// linearized voltage estimate and coulomb counting.
    pub fn remaining_mah(&self, battery: &BatteryState) -> f64 {
        let p = &self.params;
        let cell_v = battery.cell_voltage(p.cells);
        if cell_v <= p.min_cell_voltage {
            return 0.0;
        }
        let nominal_cell = p.nominal_voltage / p.cells as f64;
        let range = nominal_cell - p.min_cell_voltage;
        let frac = ((cell_v - p.min_cell_voltage) / range).clamp(0.0, 1.0);
        let voltage_based = frac * p.capacity_mah;

        if battery.consumed_mah > 0.0 {
            let coulomb_based = (p.capacity_mah - battery.consumed_mah).max(0.0);
            voltage_based.min(coulomb_based)
        } else {
            voltage_based
        }
    }

    /// Energy required to fly home, mAh, including the reserve fraction.
    pub fn rth_required_mah(&self, flight: &FlightState) -> f64 {
        let p = &self.params;
        let distance = haversine_m(flight.position, flight.home);
        let alt_change = flight.home_altitude_m - flight.altitude_m;

        let horizontal_s = distance / p.cruise_speed_ms;
        let vertical_s = alt_change.abs() / p.vertical_speed_ms;

        let cruise_wh = p.cruise_power_w * horizontal_s / 3600.0;
        let vertical_wh = if alt_change > 0.0 {
            p.climb_power_w * vertical_s / 3600.0
        } else {
            0.5 * p.cruise_power_w * vertical_s / 3600.0
        };

        let total_mah = (cruise_wh + vertical_wh) / p.nominal_voltage * 1000.0;
        let with_reserve = total_mah * (1.0 + p.reserve_fraction);
        debug!(
            distance_m = distance as i64,
            alt_change_m = alt_change as i64,
            required_mah = with_reserve as i64,
            "RTH energy estimate"
        );
        with_reserve
    }
}

/// Failsafe decision logic, rate limited to one evaluation per interval.
pub struct BatteryFailsafe {
    model: EnergyModel,
    check_interval: Duration,
    last_check: Option<Instant>,
    triggered: bool,

    warn_margin: f64,
    critical_margin: f64,
}

impl BatteryFailsafe {
    pub fn new(params: BatteryParams) -> Self {
        Self {
            model: EnergyModel::new(params),
            check_interval: Duration::from_secs(5),
            last_check: None,
            triggered: false,
            warn_margin: 0.30,
            critical_margin: 0.10,
        }
    }

    pub fn model(&self) -> &EnergyModel {
        &self.model
    }

    pub fn triggered(&self) -> bool {
        self.triggered
    }

    /// Rate-limited check; None when inside the interval.
    pub fn check(&mut self, battery: &BatteryState, flight: &FlightState) -> Option<FailsafeDecision> {
        let now = Instant::now();
        if let Some(t) = self.last_check {
            if now.duration_since(t) < self.check_interval {
                return None;
            }
        }
        self.last_check = Some(now);
        let decision = self.evaluate(battery, flight);
        if decision.is_failsafe() {
            self.triggered = true;
        }
        Some(decision)
    }

    /// The decision ladder, unmetered. Under uncertainty the outcome leans
    /// conservative: an unreadable pack reads as low margin.
    pub fn evaluate(&self, battery: &BatteryState, flight: &FlightState) -> FailsafeDecision {
        if !battery.readable() {
            warn!("battery telemetry unreadable, treating as low margin");
            return FailsafeDecision::RthNow { margin: 0.0 };
        }

        let p = &self.model.params;
        if battery.cell_voltage(p.cells) < p.min_cell_voltage {
            error!(voltage = battery.voltage, "critical cell voltage");
            return FailsafeDecision::LandNow {
                reason: format!("critical voltage: {:.2}V", battery.voltage),
            };
        }

        let remaining = self.model.remaining_mah(battery);
        let required = self.model.rth_required_mah(flight);
        if required <= 0.0 {
            return FailsafeDecision::Ok { margin: f64::INFINITY };
        }
        let margin = (remaining - required) / required;

        if margin < 0.0 {
            error!(
                remaining_mah = remaining as i64,
                required_mah = required as i64,
                "cannot reach home"
            );
            FailsafeDecision::LandNow {
                reason: format!(
                    "insufficient energy: need {:.0}mAh, have {:.0}mAh",
                    required, remaining
                ),
            }
        } else if margin < self.critical_margin {
            error!(margin_pct = (margin * 100.0) as i64, "critical energy margin");
            FailsafeDecision::RthNow { margin }
        } else if margin < self.warn_margin {
            warn!(margin_pct = (margin * 100.0) as i64, "low energy margin");
            FailsafeDecision::Warn { margin }
        } else {
            FailsafeDecision::Ok { margin }
        }
    }
}

/// Emergency landing site: a fixed offset from the current position. A
/// terrain-aware selector can replace this as long as the Option contract
/// stays: None means the caller issues an unconditional LAND.
pub fn emergency_landing_site(current: GeoPoint) -> Option<GeoPoint> {
    warn!("landing site selection uses the fixed-offset fallback");
    Some(GeoPoint::new(current.lat + 0.001, current.lon + 0.001))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flight(lat: f64, lon: f64, alt: f64) -> FlightState {
        FlightState {
            position: GeoPoint::new(lat, lon),
            altitude_m: alt,
            ground_speed: 15.0,
            heading_deg: 180.0,
            home: GeoPoint::new(21.028, 105.804),
            home_altitude_m: 10.0,
        }
    }

    fn battery(voltage: f64, consumed: f64) -> BatteryState {
        BatteryState {
            voltage,
            current: 10.0,
            remaining_pct: 50,
            consumed_mah: consumed,
        }
    }

    #[test]
    fn healthy_pack_close_to_home_is_ok() {
        let fs = BatteryFailsafe::new(BatteryParams::default());
        let d = fs.evaluate(&battery(16.0, 2000.0), &flight(21.029, 105.805, 50.0));
        assert!(matches!(d, FailsafeDecision::Ok { .. }), "{:?}", d);
    }

    #[test]
    fn exhausted_pack_far_from_home_lands_with_insufficient_energy() {
        let fs = BatteryFailsafe::new(BatteryParams::default());
        // nearly everything consumed: coulomb counting leaves ~250 mAh
        let d = fs.evaluate(&battery(14.0, 10_150.0), &flight(21.035, 105.815, 100.0));
        match d {
            FailsafeDecision::LandNow { reason } => {
                assert!(reason.contains("insufficient energy"), "{}", reason)
            }
            other => panic!("expected LandNow, got {:?}", other),
        }
    }

    #[test]
    fn critical_cell_voltage_lands_immediately() {
        let fs = BatteryFailsafe::new(BatteryParams::default());
        // 3.2 V/cell on a 4S pack
        let d = fs.evaluate(&battery(12.8, 3000.0), &flight(21.029, 105.805, 50.0));
        match d {
            FailsafeDecision::LandNow { reason } => assert!(reason.contains("voltage")),
            other => panic!("expected LandNow, got {:?}", other),
        }
    }

    #[test]
    fn unreadable_battery_is_treated_as_low_margin() {
        let fs = BatteryFailsafe::new(BatteryParams::default());
        let d = fs.evaluate(&battery(0.0, 0.0), &flight(21.029, 105.805, 50.0));
        assert!(d.is_failsafe());
    }

    #[test]
    fn remaining_short_of_required_is_never_ok() {
        let fs = BatteryFailsafe::new(BatteryParams::default());
        // sweep distances and consumption levels
        for consumed in [9_800.0, 10_000.0, 10_200.0, 10_350.0] {
            for (lat, lon) in [(21.06, 105.86), (21.10, 105.90), (21.035, 105.815)] {
                let bat = battery(14.0, consumed);
                let fl = flight(lat, lon, 120.0);
                let remaining = fs.model().remaining_mah(&bat);
                let required = fs.model().rth_required_mah(&fl);
                if remaining < required {
                    let d = fs.evaluate(&bat, &fl);
                    assert!(
                        d.is_failsafe(),
                        "remaining {:.0} < required {:.0} must trigger, got {:?}",
                        remaining,
                        required,
                        d
                    );
                }
            }
        }
    }

    #[test]
    fn descent_home_costs_less_than_climb_home() {
        let model = EnergyModel::new(BatteryParams::default());
        let descend = model.rth_required_mah(&flight(21.035, 105.815, 100.0));
        let climb = model.rth_required_mah(&FlightState {
            altitude_m: 10.0,
            home_altitude_m: 100.0,
            ..flight(21.035, 105.815, 10.0)
        });
        assert!(climb > descend);
    }

    #[test]
    fn check_is_rate_limited() {
        let mut fs = BatteryFailsafe::new(BatteryParams::default());
        let bat = battery(16.0, 2000.0);
        let fl = flight(21.029, 105.805, 50.0);
        assert!(fs.check(&bat, &fl).is_some());
        assert!(fs.check(&bat, &fl).is_none());
    }

    #[test]
    fn landing_site_is_near_current_position() {
        let p = GeoPoint::new(21.03, 105.81);
        let site = emergency_landing_site(p).unwrap();
        let d = haversine_m(p, site);
        assert!(d > 50.0 && d < 400.0, "site {} m away", d);
    }
}
