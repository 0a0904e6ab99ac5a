// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits,
    logging,
};
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Runtime options.
mod runtime_config {
    pub const SECTION_NAME: &str = "runtime";
    // Number of shared worker threads. Zero selects the available parallelism.
    pub const WORKER_THREADS: &str = "worker_threads";
    // Number of fiber slots preallocated per thread.
    pub const FIBER_POOL_SIZE: &str = "fiber_pool_size";
    // Fallback log specification.
    pub const LOG_LEVEL: &str = "log_level";
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_yaml_str(&config_s)
    }

    /// Parses a configuration from its YAML text.
    pub fn from_yaml_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration: {:?}", e);
                error!("from_yaml_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };

        Ok(Self(config_obj.clone()))
    }

    fn get_runtime_config(&self) -> Result<Option<&Yaml>, Fail> {
        Self::get_subsection(&self.0, runtime_config::SECTION_NAME)
    }

    /// Reads the number of shared worker threads from the environment variable first and then the underlying
    /// configuration. Zero, or no setting at all, selects the available parallelism of the host.
    pub fn worker_threads(&self) -> Result<usize, Fail> {
        let configured: usize = if let Some(threads) = Self::get_typed_env_option(runtime_config::WORKER_THREADS)? {
            threads
        } else {
            match self.get_runtime_config()? {
                Some(section) => Self::get_int_option(section, runtime_config::WORKER_THREADS)?.unwrap_or(0),
                None => 0,
            }
        };
        if configured != 0 {
            return Ok(configured);
        }
        Ok(::std::thread::available_parallelism().map_or(1, |n| n.get()))
    }

    /// Reads the number of fiber slots each thread preallocates.
    pub fn fiber_pool_size(&self) -> Result<usize, Fail> {
        if let Some(size) = Self::get_typed_env_option(runtime_config::FIBER_POOL_SIZE)? {
            return Ok(size);
        }
        match self.get_runtime_config()? {
            Some(section) => Ok(Self::get_int_option(section, runtime_config::FIBER_POOL_SIZE)?
                .unwrap_or(limits::FIBER_POOL_SIZE_DEFAULT)),
            None => Ok(limits::FIBER_POOL_SIZE_DEFAULT),
        }
    }

    /// Reads the fallback log specification.
    pub fn log_level(&self) -> Result<String, Fail> {
        if let Some(level) = Self::get_typed_env_option(runtime_config::LOG_LEVEL)? {
            return Ok(level);
        }
        match self.get_runtime_config()? {
            Some(section) => Ok(Self::get_typed_option(section, runtime_config::LOG_LEVEL, |yaml: &Yaml| {
                yaml.as_str().map(|s| s.to_string())
            })?
            .unwrap_or_else(|| logging::DEFAULT_LOG_SPEC.to_string())),
            None => Ok(logging::DEFAULT_LOG_SPEC.to_string()),
        }
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Returns the subsection at `index`, or `None` if it is absent.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<Option<&'a Yaml>, Fail> {
        match Self::get_option(yaml, index) {
            Some(section @ Yaml::Hash(_)) => Ok(Some(section)),
            Some(_) => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            None => Ok(None),
        }
    }

    /// Index `yaml` to find the value at `index`.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Option<&'a Yaml> {
        match yaml {
            Yaml::Hash(_) => match yaml.index(index) {
                Yaml::BadValue | Yaml::Null => None,
                value => Some(value),
            },
            _ => None,
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the receiver returns Some(_) when it exists.
    fn get_typed_option<'a, T, Fn>(yaml: &'a Yaml, index: &str, receiver: Fn) -> Result<Option<T>, Fail>
    where
        Fn: FnOnce(&'a Yaml) -> Option<T>,
    {
        let Some(option) = Self::get_option(yaml, index) else {
            return Ok(None);
        };
        match receiver(option) {
            Some(value) => Ok(Some(value)),
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Similar to `get_typed_option` using `Yaml::as_i64` as the receiver, but additionally verifies that the
    /// destination type may hold the i64 value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<Option<T>, Fail> {
        let Some(val) = Self::get_typed_option(yaml, index, &Yaml::as_i64)? else {
            return Ok(None);
        };
        match T::try_from(val) {
            Ok(val) => Ok(Some(val)),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Config {
    fn default() -> Self {
        Self(Yaml::Hash(Default::default()))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
