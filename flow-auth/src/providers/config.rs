//! PingOne-compatible endpoint layout.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{config_error, ConfigErrorKind, Error};

/// PingOne deployment regions and their auth domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    NorthAmerica,
    Europe,
    Canada,
    AsiaPacific,
    Australia,
}

impl Region {
    /// Base URL of the authorization server for this region.
    pub fn auth_base_url(&self) -> &'static str {
        match self {
            Region::NorthAmerica => "https://auth.pingone.com",
            Region::Europe => "https://auth.pingone.eu",
            Region::Canada => "https://auth.pingone.ca",
            Region::AsiaPacific => "https://auth.pingone.asia",
            Region::Australia => "https://auth.pingone.com.au",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct RegionParseError;

impl fmt::Display for RegionParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown region (expected na, eu, ca, ap or au)")
    }
}

impl std::error::Error for RegionParseError {}

impl FromStr for Region {
    type Err = RegionParseError;
    fn from_str(region: &str) -> Result<Region, Self::Err> {
        match region.to_lowercase().as_str() {
            "na" | "us" | "com" | "north_america" => Ok(Region::NorthAmerica),
            "eu" | "europe" => Ok(Region::Europe),
            "ca" | "canada" => Ok(Region::Canada),
            "ap" | "asia" | "asia_pacific" => Ok(Region::AsiaPacific),
            "au" | "australia" => Ok(Region::Australia),
            _ => Err(RegionParseError),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Region::NorthAmerica => write!(f, "na"),
            Region::Europe => write!(f, "eu"),
            Region::Canada => write!(f, "ca"),
            Region::AsiaPacific => write!(f, "ap"),
            Region::Australia => write!(f, "au"),
        }
    }
}

/// Endpoint URLs for one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Environment identifier the endpoints belong to.
    pub environment_id: String,
    pub issuer: String,
    pub authorization: String,
    pub token: String,
    pub device_authorization: String,
    pub backchannel_authentication: String,
    pub revocation: String,
    pub userinfo: String,
    /// Base for redirectless flow objects: `{flows_base}/{flow_id}`.
    pub flows_base: String,
}

impl Endpoints {
    /// Endpoints for a PingOne environment in the given region.
    pub fn pingone(region: Region, environment_id: &str) -> Result<Self, Error> {
        Self::from_base(region.auth_base_url(), environment_id)
    }

    /// Endpoints for a PingOne-compatible server rooted at `base_url`.
    pub fn from_base(base_url: &str, environment_id: &str) -> Result<Self, Error> {
        if environment_id.trim().is_empty() {
            return Err(config_error(
                ConfigErrorKind::MissingField("environment_id"),
                "an environment id is required to derive endpoints",
            ));
        }
        if base_url.trim().is_empty() {
            return Err(config_error(
                ConfigErrorKind::MissingField("auth_base_url"),
                "an authorization server base URL is required",
            ));
        }

        let root = format!("{}/{}", base_url.trim_end_matches('/'), environment_id);
        let issuer = format!("{root}/as");
        Ok(Self {
            environment_id: environment_id.to_string(),
            authorization: format!("{issuer}/authorize"),
            token: format!("{issuer}/token"),
            device_authorization: format!("{issuer}/device_authorization"),
            backchannel_authentication: format!("{issuer}/bc-authorize"),
            revocation: format!("{issuer}/revoke"),
            userinfo: format!("{issuer}/userinfo"),
            flows_base: format!("{root}/flows"),
            issuer,
        })
    }

    /// URL of a redirectless flow object.
    pub fn flow_url(&self, flow_id: &str) -> String {
        format!("{}/{}", self.flows_base, flow_id)
    }
}
