use crate::types::MachineClass;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// FIT manufacturer id reserved for development devices
pub const MANUFACTURER_DEVELOPMENT: u16 = 255;

/// Serial number used when the transport does not expose one
pub const DEFAULT_SERIAL_NUMBER: u32 = 123_456_789;

/// FIT `sport` values used by supported machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Sport {
    /// Cycling
    Cycling = 2,
    /// Rowing
    Rowing = 15,
}

/// FIT `sub_sport` values used by supported machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubSport {
    /// Indoor cycling
    IndoorCycling = 6,
    /// Indoor rowing
    IndoorRowing = 14,
}

impl fmt::Display for Sport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycling => write!(f, "cycling"),
            Self::Rowing => write!(f, "rowing"),
        }
    }
}

impl fmt::Display for SubSport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndoorCycling => write!(f, "indoor_cycling"),
            Self::IndoorRowing => write!(f, "indoor_rowing"),
        }
    }
}

/// Sport and sub-sport reported for a machine class
///
/// Training-load features of the target platform key off these two values,
/// so every class must map to exactly one pair.
#[must_use]
pub const fn sport_for(machine_class: MachineClass) -> (Sport, SubSport) {
    match machine_class {
        MachineClass::Bike => (Sport::Cycling, SubSport::IndoorCycling),
        MachineClass::Rower => (Sport::Rowing, SubSport::IndoorRowing),
    }
}

/// A product in the device registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownProduct {
    /// FIT product id
    pub product: u16,
    /// Display name
    pub name: &'static str,
    /// Machine class of the product
    pub machine_class: MachineClass,
}

/// Rogue Echo Bike
pub const ECHO_BIKE: KnownProduct = KnownProduct {
    product: 1001,
    name: "Rogue Echo Bike",
    machine_class: MachineClass::Bike,
};

/// Rogue Echo Rower
pub const ECHO_ROWER: KnownProduct = KnownProduct {
    product: 1002,
    name: "Rogue Echo Rower",
    machine_class: MachineClass::Rower,
};

/// Any other FTMS indoor bike
pub const GENERIC_BIKE: KnownProduct = KnownProduct {
    product: 1003,
    name: "Indoor Bike",
    machine_class: MachineClass::Bike,
};

/// Any other FTMS rower
pub const GENERIC_ROWER: KnownProduct = KnownProduct {
    product: 1004,
    name: "Indoor Rower",
    machine_class: MachineClass::Rower,
};

/// Every registered product
pub const KNOWN_PRODUCTS: [KnownProduct; 4] = [ECHO_BIKE, ECHO_ROWER, GENERIC_BIKE, GENERIC_ROWER];

/// Immutable identity of the recording device, written into the activity file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// FIT manufacturer id
    pub manufacturer: u16,
    /// FIT product id
    pub product: u16,
    /// Serial number, must not be zero
    pub serial_number: u32,
    /// Human-readable product name
    pub product_name: String,
    /// Software version times 100
    pub software_version: u16,
    /// Hardware version
    pub hardware_version: u8,
    /// Machine class the device records
    pub machine_class: MachineClass,
}

impl DeviceIdentity {
    /// Identity for a registered product
    #[must_use]
    pub fn for_product(product: KnownProduct, serial_number: u32) -> Self {
        Self {
            manufacturer: MANUFACTURER_DEVELOPMENT,
            product: product.product,
            serial_number,
            product_name: product.name.to_string(),
            software_version: 100,
            hardware_version: 1,
            machine_class: product.machine_class,
        }
    }

    /// Generic identity for a machine class
    #[must_use]
    pub fn generic(machine_class: MachineClass) -> Self {
        let product = match machine_class {
            MachineClass::Bike => GENERIC_BIKE,
            MachineClass::Rower => GENERIC_ROWER,
        };
        Self::for_product(product, DEFAULT_SERIAL_NUMBER)
    }

    /// Replace the serial number
    #[must_use]
    pub const fn with_serial_number(mut self, serial_number: u32) -> Self {
        self.serial_number = serial_number;
        self
    }

    /// FIT sport for this device
    #[must_use]
    pub const fn sport(&self) -> Sport {
        sport_for(self.machine_class).0
    }

    /// FIT sub-sport for this device
    #[must_use]
    pub const fn sub_sport(&self) -> SubSport {
        sport_for(self.machine_class).1
    }
}

/// Match an advertised device name against the registry
///
/// Rogue or Echo names with a bike or rower keyword map to the Echo products.
/// Other names only match the generic product of `machine_class` when they
/// carry that class's keyword.
#[must_use]
pub fn match_product(device_name: &str, machine_class: MachineClass) -> Option<KnownProduct> {
    let name = device_name.to_lowercase();
    let has = |keywords: &[&str]| keywords.iter().any(|k| name.contains(k));
    let branded = has(&["rogue", "echo"]);
    let bike = has(&["bike", "cycle"]);
    let rower = has(&["rower", "row"]);

    if branded && bike {
        return Some(ECHO_BIKE);
    }
    if branded && rower {
        return Some(ECHO_ROWER);
    }
    match machine_class {
        MachineClass::Bike if bike => Some(GENERIC_BIKE),
        MachineClass::Rower if rower => Some(GENERIC_ROWER),
        _ => None,
    }
}

/// Identify the device recording a session
///
/// Falls back to the generic product for `machine_class` when the name is
/// missing, unknown, or names a product of the other class.
#[must_use]
pub fn identify(device_name: Option<&str>, machine_class: MachineClass) -> DeviceIdentity {
    let matched = device_name
        .and_then(|name| match_product(name, machine_class))
        .filter(|product| product.machine_class == machine_class);

    if let Some(product) = matched {
        info!("Identified {} from name {:?}", product.name, device_name);
        DeviceIdentity::for_product(product, DEFAULT_SERIAL_NUMBER)
    } else {
        info!("Using generic {machine_class} identification");
        DeviceIdentity::generic(machine_class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sport_mapping_table() {
        let table = [
            (MachineClass::Bike, Sport::Cycling, 2, SubSport::IndoorCycling, 6),
            (MachineClass::Rower, Sport::Rowing, 15, SubSport::IndoorRowing, 14),
        ];
        for (class, sport, sport_code, sub_sport, sub_sport_code) in table {
            assert_eq!(sport_for(class), (sport, sub_sport));
            assert_eq!(sport as u8, sport_code);
            assert_eq!(sub_sport as u8, sub_sport_code);
        }
    }

    #[test]
    fn test_registry_products_are_unique() {
        for (i, a) in KNOWN_PRODUCTS.iter().enumerate() {
            for b in &KNOWN_PRODUCTS[i + 1..] {
                assert_ne!(a.product, b.product);
            }
        }
    }

    #[test]
    fn test_name_matching() {
        assert_eq!(match_product("Rogue Echo Bike 1234", MachineClass::Bike), Some(ECHO_BIKE));
        assert_eq!(match_product("ECHO ROWER", MachineClass::Rower), Some(ECHO_ROWER));
        assert_eq!(match_product("KICKR BIKE", MachineClass::Bike), Some(GENERIC_BIKE));
        assert_eq!(match_product("KICKR BIKE", MachineClass::Rower), None);
        assert_eq!(match_product("Wahoo KICKR", MachineClass::Bike), None);
    }

    #[test]
    fn test_identify_falls_back_to_generic() {
        let identity = identify(None, MachineClass::Rower);
        assert_eq!(identity.product, GENERIC_ROWER.product);
        assert_eq!(identity.manufacturer, MANUFACTURER_DEVELOPMENT);
        assert_eq!(identity.sport(), Sport::Rowing);
        assert_eq!(identity.sub_sport(), SubSport::IndoorRowing);

        // a bike name cannot label a rowing session
        let identity = identify(Some("Rogue Echo Bike"), MachineClass::Rower);
        assert_eq!(identity.product, GENERIC_ROWER.product);
        assert_eq!(identity.machine_class, MachineClass::Rower);
    }

    #[test]
    fn test_identify_echo_bike() {
        let identity = identify(Some("Echo Bike"), MachineClass::Bike);
        assert_eq!(identity.product, 1001);
        assert_eq!(identity.product_name, "Rogue Echo Bike");
        assert_ne!(identity.serial_number, 0);
    }
}
