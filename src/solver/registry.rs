//! Name → constructor table for Krylov methods.
//!
//! `-ksp_type <name>` is resolved here. The built-in methods are registered by
//! [`KspRegistry::with_defaults`]; applications may add their own configured
//! variants (e.g. a Chebyshev iteration with problem-specific bounds).

use crate::core::traits::Scalar;
use crate::error::KError;
use crate::solver::{BiCg, BiCgStab, Cgs, Chebyshev, Cr, KrylovMethod};
use std::collections::BTreeMap;

type Factory<T> = Box<dyn Fn() -> KrylovMethod<T> + Send + Sync>;

pub struct KspRegistry<T> {
    factories: BTreeMap<String, Factory<T>>,
}

impl<T: Scalar> Default for KspRegistry<T> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<T: Scalar> KspRegistry<T> {
    /// An empty registry.
    pub fn new() -> Self {
        Self { factories: BTreeMap::new() }
    }

    /// `bicg`, `cgs`, `chebyshev`, `cr` and `bcgs`.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register("bicg", || BiCg::new().into());
        reg.register("cgs", || Cgs::new().into());
        reg.register("chebyshev", || Chebyshev::<T>::default().into());
        reg.register("cr", || Cr::new().into());
        reg.register("bcgs", || BiCgStab::new().into());
        reg
    }

    /// Add or replace the constructor for `name`.
    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> KrylovMethod<T> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_ascii_lowercase(), Box::new(factory));
        self
    }

    pub fn create(&self, name: &str) -> Result<KrylovMethod<T>, KError> {
        self.factories
            .get(&name.to_ascii_lowercase())
            .map(|f| f())
            .ok_or_else(|| KError::UnknownType { kind: "ksp", name: name.to_string() })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
