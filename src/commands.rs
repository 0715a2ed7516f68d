pub mod registers {
    use std::path::PathBuf;

    use crate::catalog::{self, Catalog, MeterProfile, RegisterDescriptor, ValueType};
    use crate::output::{self, Destination, Format, Listing};

    /// Search and output the registers of known meter types.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
        format: Format,
        /// Only list the registers of this meter type.
        #[arg(long = "metertype", short = 't')]
        meter_type: Option<String>,
        /// Only list registers with a name, description or address containing this text.
        filter: Option<String>,
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the meter catalog")]
        Catalog(#[source] catalog::Error),
        #[error("could not output the registers")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub meter_type: &'static str,
        pub address: u16,
        pub name: &'static str,
        #[serde(rename = "type")]
        pub value_type: ValueType,
        pub description: &'static str,
    }

    impl RegisterSchema {
        pub fn new(profile: &MeterProfile, register: &RegisterDescriptor) -> Self {
            RegisterSchema {
                meter_type: profile.id,
                address: register.address,
                name: register.name,
                value_type: register.value_type,
                description: register.description,
            }
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_uppercase();
            if self.name.to_uppercase().contains(&pattern) {
                return true;
            }
            if self.description.to_uppercase().contains(&pattern) {
                return true;
            }
            if format!("{:#06x}", self.address).to_uppercase().contains(&pattern) {
                return true;
            }
            false
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let catalog = Catalog::builtin().map_err(Error::Catalog)?;
        let profiles = match &args.meter_type {
            None => catalog.profiles().collect::<Vec<_>>(),
            Some(id) => vec![catalog.lookup(id).map_err(Error::Catalog)?],
        };
        let destination = Destination::open(args.output).map_err(Error::Output)?;
        let mut listing = Listing::new(destination, args.format);
        listing
            .table_headers(vec!["Meter type", "Address", "Name", "Type", "Description"])
            .map_err(Error::Output)?;
        for profile in profiles {
            for register in profile.registers {
                let schema = RegisterSchema::new(profile, register);
                if let Some(pattern) = &args.filter {
                    if !schema.is_match(pattern) {
                        continue;
                    }
                }
                listing
                    .row(
                        || {
                            vec![
                                schema.meter_type.to_string(),
                                format!("{:#06x}", schema.address),
                                schema.name.to_string(),
                                schema.value_type.to_string(),
                                schema.description.to_string(),
                            ]
                        },
                        || &schema,
                    )
                    .map_err(Error::Output)?;
            }
        }
        listing.commit().map_err(Error::Output)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn matches_name_description_and_address() {
            let catalog = Catalog::builtin().unwrap();
            let profile = catalog.lookup("EASTRON_SDM630V2").unwrap();
            let schema = RegisterSchema::new(profile, profile.register("L1_MAX_A").unwrap());
            assert!(schema.is_match("max_a"));
            assert!(schema.is_match("maximum current"));
            assert!(schema.is_match("0x0108"));
            assert!(!schema.is_match("kWh"));
        }
    }
}

pub mod meters {
    use std::path::PathBuf;

    use crate::catalog::{self, Catalog};
    use crate::output::{self, Destination, Format, Listing};

    /// List the known meter types.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
        format: Format,
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the meter catalog")]
        Catalog(#[source] catalog::Error),
        #[error("could not output the meter types")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct MeterSchema {
        meter_type: &'static str,
        name: &'static str,
        registers: usize,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let catalog = Catalog::builtin().map_err(Error::Catalog)?;
        let destination = Destination::open(args.output).map_err(Error::Output)?;
        let mut listing = Listing::new(destination, args.format);
        listing.table_headers(vec!["Meter type", "Name", "Registers"]).map_err(Error::Output)?;
        for profile in catalog.profiles() {
            let schema = MeterSchema {
                meter_type: profile.id,
                name: profile.display_name,
                registers: profile.registers.len(),
            };
            listing
                .row(
                    || {
                        vec![
                            schema.meter_type.to_string(),
                            schema.name.to_string(),
                            schema.registers.to_string(),
                        ]
                    },
                    || &schema,
                )
                .map_err(Error::Output)?;
        }
        listing.commit().map_err(Error::Output)
    }
}

pub mod read {
    use std::path::PathBuf;

    use crate::catalog::{self, Catalog, MeterProfile};
    use crate::connection::{self, Connection, Transport};
    use crate::output::{self, Destination};
    use crate::reader::{self, ReadResult};
    use crate::record::{self, Record, Timestamps};

    /// Read all registers of a meter once and output them as a JSON record.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,

        /// Name to give the meter in the JSON output attribute "meterName".
        #[arg(long = "metername", default_value = "meter1")]
        meter_name: String,

        /// Value to set the "type" attribute to in the output JSON record.
        #[arg(long = "jsontype", default_value = "electricityMeterReading")]
        json_type: String,

        /// Type of the energy meter. See the `meters` command.
        #[arg(long = "metertype", short = 't', default_value = "EASTRON_SDM630V2")]
        meter_type: String,

        /// Abort on the first register that cannot be read, instead of recording it as
        /// "READ_FAILED" and carrying on.
        #[arg(long)]
        strict: bool,

        /// Pretty-print the JSON record.
        #[arg(long)]
        pretty: bool,

        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the meter catalog")]
        Catalog(#[source] catalog::Error),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to the meter")]
        Connect(#[source] connection::Error),
        #[error("could not read the meter")]
        Read(#[source] reader::Error),
        #[error("could not output the record")]
        Output(#[source] output::Error),
    }

    /// Look up `meter_type` and read all of its registers through the transport `connect`
    /// produces. Nothing is connected to if the meter type is unknown.
    pub async fn read_meter<T, F>(
        catalog: &Catalog,
        meter_type: &str,
        connect: F,
        strict: bool,
    ) -> Result<(&'static MeterProfile, ReadResult), Error>
    where
        T: Transport,
        F: FnOnce() -> Result<T, connection::Error>,
    {
        let profile = catalog.lookup(meter_type).map_err(Error::Catalog)?;
        let mut transport = connect().map_err(Error::Connect)?;
        let readings = if strict {
            reader::read_all_strict(profile, &mut transport).await.map_err(Error::Read)?
        } else {
            reader::read_all(profile, &mut transport).await
        };
        Ok((profile, readings))
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let catalog = Catalog::builtin().map_err(Error::Catalog)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        let timestamps = Timestamps::now();
        let (profile, readings) = runtime.block_on(read_meter(
            &catalog,
            &args.meter_type,
            || Connection::open(args.connection.clone()),
            args.strict,
        ))?;
        if readings.failures() != 0 {
            tracing::warn!(
                failed = readings.failures(),
                total = readings.len(),
                "some registers could not be read"
            );
        }

        let program = std::env::args().next().unwrap_or_default();
        let collector = record::collector(
            &program,
            &record::hostname(),
            &args.connection.serial_port.to_string_lossy(),
            args.connection.device_id,
        );
        let record = Record {
            kind: &args.json_type,
            meter_name: &args.meter_name,
            meter_type: profile.display_name,
            collector: &collector,
            timestamps,
            readings: &readings,
        };
        let mut destination = Destination::open(args.output).map_err(Error::Output)?;
        destination.json(&record, args.pretty).map_err(Error::Output)?;
        destination.flush().map_err(Error::Output)
    }
}
