//! Cached device location sent with session begin

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::LocationConfig;
use crate::request::Params;

/// A location as reported to the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    /// ISO country code
    pub country_code: Option<String>,
    pub city: Option<String>,
    /// "latitude,longitude"
    pub gps: Option<String>,
    pub ip: Option<String>,
}

impl Location {
    pub fn is_empty(&self) -> bool {
        self.country_code.is_none() && self.city.is_none() && self.gps.is_none() && self.ip.is_none()
    }

    fn params(&self) -> Params {
        let mut params = Params::new();
        if let Some(country) = &self.country_code {
            params.insert("country_code", country.as_str());
        }
        if let Some(city) = &self.city {
            params.insert("city", city.as_str());
        }
        if let Some(gps) = &self.gps {
            params.insert("location", gps.as_str());
        }
        if let Some(ip) = &self.ip {
            params.insert("ip_address", ip.as_str());
        }
        params
    }
}

#[derive(Debug, Default)]
struct LocationState {
    location: Location,
    disabled: bool,
}

#[derive(Debug, Default)]
pub struct LocationCache {
    state: Mutex<LocationState>,
}

impl LocationCache {
    pub fn from_config(config: &LocationConfig) -> Self {
        Self {
            state: Mutex::new(LocationState {
                location: Location {
                    country_code: config.country_code.clone(),
                    city: config.city.clone(),
                    gps: config.gps.clone(),
                    ip: config.ip.clone(),
                },
                disabled: config.disabled,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LocationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, location: Location) {
        let mut state = self.state();
        state.location = location;
        state.disabled = false;
    }

    pub fn disable(&self) {
        let mut state = self.state();
        state.location = Location::default();
        state.disabled = true;
    }

    pub fn clear(&self) {
        self.state().location = Location::default();
    }

    pub fn current(&self) -> Location {
        self.state().location.clone()
    }

    /// Params describing the cached location; an empty `location` tells the
    /// server not to resolve one
    pub fn params(&self) -> Params {
        let state = self.state();
        if state.disabled {
            return Params::new().with("location", "");
        }
        state.location.params()
    }

    /// Request params that erase the location on the server
    pub fn erase_params() -> Params {
        Params::new().with("location", "")
    }
}
