//! Geographic positions exchanged on the geo channel.

use crate::UserId;
use serde::{Deserialize, Serialize};

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Both components are finite and within the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A peer's last reported position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendLocation {
    pub user_id: UserId,
    pub username: String,
    pub lat: f64,
    pub lng: f64,
}

impl FriendLocation {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_ranges() {
        assert!(Coordinates::new(48.85, 2.35).is_valid());
        assert!(!Coordinates::new(91.0, 0.0).is_valid());
        assert!(!Coordinates::new(0.0, f64::NAN).is_valid());
    }

    #[test]
    fn friend_location_uses_camel_case() {
        let json = r#"{"userId":"u1","username":"ana","lat":1.0,"lng":2.0}"#;
        let friend: FriendLocation = serde_json::from_str(json).unwrap();
        assert_eq!(friend.user_id.as_str(), "u1");
        assert_eq!(friend.coordinates(), Coordinates::new(1.0, 2.0));
    }
}
