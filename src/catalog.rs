//! Known meter models and the input registers they expose.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    /// Two consecutive input registers holding an IEEE-754 single, high word first.
    Float32,
    /// A kind a profile may declare, but which is not decoded. Carries the declared tag.
    Other(&'static str),
}

impl ValueType {
    // Convenience alias for nicely tabulated `registers!` definitions below.
    pub const F32: Self = Self::Float32;

    /// Number of 16-bit registers a value of this kind spans, if it can be decoded at all.
    pub const fn words(&self) -> Option<u16> {
        match self {
            Self::Float32 => Some(2),
            Self::Other(_) => None,
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float32 => f.write_str("float"),
            Self::Other(tag) => f.write_str(tag),
        }
    }
}

impl serde::Serialize for ValueType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct RegisterDescriptor {
    pub address: u16,
    pub name: &'static str,
    pub description: &'static str,
    pub value_type: ValueType,
}

#[derive(Clone, Copy, Debug)]
pub struct MeterProfile {
    pub id: &'static str,
    pub display_name: &'static str,
    /// Output field order follows the order of this list.
    pub registers: &'static [RegisterDescriptor],
}

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Defect {
    #[error("no registers are declared")]
    NoRegisters,
    #[error("address {0:#06x} is declared more than once")]
    DuplicateAddress(u16),
    #[error("register `{0}` is declared more than once")]
    DuplicateName(&'static str),
    #[error("the identifier is used by more than one profile")]
    DuplicateId,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown meter type `{0}`")]
    UnknownMeterType(String),
    #[error("meter profile `{1}` is malformed")]
    MalformedCatalog(#[source] Defect, &'static str),
}

impl MeterProfile {
    /// Checks the profile invariants. Usable in const contexts.
    pub const fn defect(&self) -> Option<Defect> {
        let registers = self.registers;
        if registers.is_empty() {
            return Some(Defect::NoRegisters);
        }
        let mut i = 0;
        while i < registers.len() {
            let mut j = i + 1;
            while j < registers.len() {
                if registers[i].address == registers[j].address {
                    return Some(Defect::DuplicateAddress(registers[j].address));
                }
                if same_str(registers[i].name, registers[j].name) {
                    return Some(Defect::DuplicateName(registers[j].name));
                }
                j += 1;
            }
            i += 1;
        }
        None
    }

    pub fn register(&self, name: &str) -> Option<&'static RegisterDescriptor> {
        self.registers.iter().find(|r| r.name == name)
    }
}

const fn same_str(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut index = 0;
    while index < a.len() {
        if a[index] != b[index] {
            return false;
        }
        index += 1;
    }
    true
}

/// A validated set of meter profiles.
#[derive(Clone, Copy)]
pub struct Catalog {
    profiles: &'static [MeterProfile],
}

impl Catalog {
    pub fn new(profiles: &'static [MeterProfile]) -> Result<Catalog, Error> {
        for (index, profile) in profiles.iter().enumerate() {
            if let Some(defect) = profile.defect() {
                return Err(Error::MalformedCatalog(defect, profile.id));
            }
            if profiles[..index].iter().any(|p| p.id == profile.id) {
                return Err(Error::MalformedCatalog(Defect::DuplicateId, profile.id));
            }
        }
        tracing::debug!(profiles = profiles.len(), "meter catalog validated");
        Ok(Catalog { profiles })
    }

    pub fn builtin() -> Result<Catalog, Error> {
        Self::new(PROFILES)
    }

    pub fn lookup(&self, meter_type: &str) -> Result<&'static MeterProfile, Error> {
        self.profiles
            .iter()
            .find(|p| p.id == meter_type)
            .ok_or_else(|| Error::UnknownMeterType(meter_type.to_string()))
    }

    pub fn profiles(&self) -> impl Iterator<Item = &'static MeterProfile> {
        self.profiles.iter()
    }
}

macro_rules! registers {
    ($($address: literal: $kind: ident, $name: literal, $description: literal;)+) => {
        &[$(RegisterDescriptor {
            address: $address,
            name: $name,
            description: $description,
            value_type: ValueType::$kind,
        }),+]
    };
}

// Addresses are the raw input register offsets from the vendor documentation. They are not
// contiguous and are kept exactly as documented.
const BUILTIN: &[MeterProfile] = &[
    MeterProfile {
        id: "EASTRON_SDM630V2",
        display_name: "Eastron SDM630V2",
        registers: registers! {
            0x0000: F32, "L1_V", "L1 Line to Neutral (V)";
            0x0002: F32, "L2_V", "L2 Line to Neutral (V)";
            0x0004: F32, "L3_V", "L3 Line to Neutral (V)";

            0x00C8: F32, "L1L2_V", "L1 Line to L2 (V)";
            0x00CA: F32, "L2L3_V", "L2 Line to L3 (V)";
            0x00CC: F32, "L3L1_V", "L3 Line to L1 (V)";

            0x0006: F32, "L1_A", "L1 Current (A)";
            0x0008: F32, "L2_A", "L2 Current (A)";
            0x000A: F32, "L3_A", "L3 Current (A)";
            0x00E0: F32, "N_A", "Neutral Current (A)";

            0x000C: F32, "L1_W", "L1 Power (W)";
            0x000E: F32, "L2_W", "L2 Power (W)";
            0x0010: F32, "L3_W", "L3 Power (W)";

            0x0012: F32, "L1_VA", "L1 Volt Amps (VA)";
            0x0014: F32, "L2_VA", "L2 Volt Amps (VA)";
            0x0016: F32, "L3_VA", "L3 Volt Amps (VA)";

            0x0034: F32, "Tot_W", "Total System Power (W)";
            0x0038: F32, "Tot_VA", "Total System Volt Amps (VA)";
            0x0156: F32, "Tot_kWh", "Total Energy (kWh)";
            0x0046: F32, "LineFrequence_Hz", "Line frequency (Hz)";

            0x0048: F32, "EnergyImported_kWh", "Energy Imported Accumulated (kWh)";
            0x004A: F32, "EnergyExported_kWh", "Energy Exported Accumulated (kWh)";

            0x0054: F32, "N_MAX_A", "Neutral Maximum Current (A)";
            0x0108: F32, "L1_MAX_A", "L1 Maximum Current (A)";
            0x010A: F32, "L2_MAX_A", "L2 Maximum Current (A)";
            0x010C: F32, "L3_MAX_A", "L3 Maximum Current (A)";
        },
    },
    MeterProfile {
        id: "EASTRON_SDM120",
        display_name: "Eastron SDM120",
        registers: registers! {
            0x0000: F32, "V", "Line to Neutral (V)";
            0x0006: F32, "A", "Current (A)";
            0x000C: F32, "W", "Active Power (W)";
            0x0012: F32, "VA", "Apparent Power (VA)";
            0x0018: F32, "VAr", "Reactive Power (VAr)";
            0x001E: F32, "PF", "Power Factor";
            0x0024: F32, "PhaseAngle_Deg", "Phase Angle (Degree)";
            0x0046: F32, "LineFrequence_Hz", "Line frequency (Hz)";
            0x0048: F32, "EnergyImported_kWh", "Import Active Energy (kWh)";
            0x004A: F32, "EnergyExported_kWh", "Export Active Energy (kWh)";
            0x004C: F32, "ReactiveImported_kVArh", "Import Reactive Energy (kVArh)";
            0x004E: F32, "ReactiveExported_kVArh", "Export Reactive Energy (kVArh)";
            0x0156: F32, "Tot_kWh", "Total Active Energy (kWh)";
            0x0158: F32, "Tot_kVArh", "Total Reactive Energy (kVArh)";
        },
    },
];

pub static PROFILES: &[MeterProfile] = BUILTIN;

const _ASSERT_BUILTIN_PROFILES_WELL_FORMED: () = const {
    let mut index = 0;
    while index < BUILTIN.len() {
        if BUILTIN[index].defect().is_some() {
            panic!("a built-in meter profile is empty or has duplicate addresses or names");
        }
        index += 1;
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    static EMPTY: &[MeterProfile] =
        &[MeterProfile { id: "EMPTY", display_name: "Empty", registers: &[] }];

    static DUPLICATE_ADDRESS: &[MeterProfile] = &[MeterProfile {
        id: "DUP_ADDR",
        display_name: "Duplicate address",
        registers: registers! {
            0x0000: F32, "A", "first";
            0x0002: F32, "B", "second";
            0x0000: F32, "C", "third";
        },
    }];

    static DUPLICATE_NAME: &[MeterProfile] = &[MeterProfile {
        id: "DUP_NAME",
        display_name: "Duplicate name",
        registers: registers! {
            0x0000: F32, "A", "first";
            0x0002: F32, "A", "second";
        },
    }];

    static DUPLICATE_ID: &[MeterProfile] = &[
        MeterProfile { id: "SAME", display_name: "One", registers: registers! { 0x0: F32, "A", ""; } },
        MeterProfile { id: "SAME", display_name: "Two", registers: registers! { 0x0: F32, "A", ""; } },
    ];

    #[test]
    fn builtin_profiles_are_well_formed() {
        let catalog = Catalog::builtin().unwrap();
        for profile in catalog.profiles() {
            assert!(!profile.registers.is_empty(), "{}", profile.id);
            let mut addresses = profile.registers.iter().map(|r| r.address).collect::<Vec<_>>();
            addresses.sort_unstable();
            addresses.dedup();
            assert_eq!(addresses.len(), profile.registers.len(), "{}", profile.id);
            let mut names = profile.registers.iter().map(|r| r.name).collect::<Vec<_>>();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), profile.registers.len(), "{}", profile.id);
        }
    }

    #[test]
    fn lookup_finds_profile() {
        let catalog = Catalog::builtin().unwrap();
        let profile = catalog.lookup("EASTRON_SDM630V2").unwrap();
        assert_eq!(profile.display_name, "Eastron SDM630V2");
        assert_eq!(profile.registers.len(), 26);
        assert_eq!(profile.registers[0].name, "L1_V");
        assert_eq!(profile.registers[0].address, 0x00);
        assert_eq!(profile.register("Tot_kWh").unwrap().address, 0x0156);
        assert_eq!(profile.register("L1_MAX_A").unwrap().address, 0x0108);
    }

    #[test]
    fn lookup_unknown_meter_type() {
        let catalog = Catalog::builtin().unwrap();
        let err = catalog.lookup("EASTRON_SDM999").unwrap_err();
        assert!(matches!(err, Error::UnknownMeterType(ref t) if t == "EASTRON_SDM999"));
        assert_eq!(err.to_string(), "unknown meter type `EASTRON_SDM999`");
    }

    #[test]
    fn empty_profile_is_rejected() {
        let Err(Error::MalformedCatalog(defect, id)) = Catalog::new(EMPTY) else {
            panic!("empty profile accepted");
        };
        assert_eq!(defect, Defect::NoRegisters);
        assert_eq!(id, "EMPTY");
    }

    #[test]
    fn duplicates_are_rejected() {
        let Err(Error::MalformedCatalog(defect, _)) = Catalog::new(DUPLICATE_ADDRESS) else {
            panic!("duplicate address accepted");
        };
        assert_eq!(defect, Defect::DuplicateAddress(0x0000));
        let Err(Error::MalformedCatalog(defect, _)) = Catalog::new(DUPLICATE_NAME) else {
            panic!("duplicate name accepted");
        };
        assert_eq!(defect, Defect::DuplicateName("A"));
        let Err(Error::MalformedCatalog(defect, id)) = Catalog::new(DUPLICATE_ID) else {
            panic!("duplicate id accepted");
        };
        assert_eq!((defect, id), (Defect::DuplicateId, "SAME"));
    }

    #[test]
    fn value_type_words() {
        assert_eq!(ValueType::Float32.words(), Some(2));
        assert_eq!(ValueType::Other("int16").words(), None);
        assert_eq!(ValueType::Other("int16").to_string(), "int16");
    }
}
