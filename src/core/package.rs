/*
 * Packages bundle the resources that are written together: one cast, one cruise leg, one
 * day of underway data. A package is created the first time the read phase sees its key
 * and is never removed during a run; the transform phase may only add resources to it or,
 * in narrow cases, rekey it.
 */
use crate::core::resource::{CollectionError, Resource, ResourceCollection};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Package {
    key: String,
    instrument: String,
    resources: ResourceCollection,
}

impl Package {
    pub fn new(key: impl Into<String>, instrument: impl Into<String>) -> Result<Self, CollectionError> {
        let key = key.into();
        if key.is_empty() {
            return Err(CollectionError::EmptyPackageKey);
        }
        Ok(Package {
            key,
            instrument: instrument.into(),
            resources: ResourceCollection::new(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn resources(&self) -> &ResourceCollection {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceCollection {
        &mut self.resources
    }

    pub fn add_resource(&mut self, resource: Resource) -> Result<(), CollectionError> {
        self.resources.add(resource)
    }

    /// Number of resources the storage backend would write.
    pub fn writable_count(&self) -> usize {
        self.resources
            .iter()
            .filter(|r| r.target_path().is_some())
            .count()
    }

    fn set_key(&mut self, key: String) -> Result<(), CollectionError> {
        if key.is_empty() {
            return Err(CollectionError::EmptyPackageKey);
        }
        self.key = key;
        Ok(())
    }
}

impl std::fmt::Display for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PackageCollection {
    packages: Vec<Package>,
    index: HashMap<String, usize>,
}

impl PackageCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, package: Package) -> Result<(), CollectionError> {
        if self.index.contains_key(package.key()) {
            return Err(CollectionError::PackageAlreadyInCollection(
                package.key().to_string(),
            ));
        }
        self.index.insert(package.key().to_string(), self.packages.len());
        self.packages.push(package);
        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Result<&Package, CollectionError> {
        self.index
            .get(key)
            .map(|&position| &self.packages[position])
            .ok_or_else(|| CollectionError::PackageNotInCollection(key.to_string()))
    }

    pub fn get_mut(&mut self, key: &str) -> Result<&mut Package, CollectionError> {
        match self.index.get(key) {
            Some(&position) => Ok(&mut self.packages[position]),
            None => Err(CollectionError::PackageNotInCollection(key.to_string())),
        }
    }

    /// Returns the package for `key`, creating it for `instrument` on first sight.
    pub fn get_or_create(
        &mut self,
        key: &str,
        instrument: &str,
    ) -> Result<&mut Package, CollectionError> {
        if !self.has(key) {
            self.add(Package::new(key, instrument)?)?;
        }
        self.get_mut(key)
    }

    /*
     * Renames a package. When `new_key` already names another package, the resources of
     * `old_key` are merged into it and the emptied package is dropped; the merge fails if
     * both packages hold a resource with the same source path. Resources are moved as
     * they are: target paths derived from a key must be recomputed by the caller, and
     * several dependent renames belong in one `rekey_all` call.
     */
    pub fn rekey(&mut self, old_key: &str, new_key: &str) -> Result<(), CollectionError> {
        if old_key == new_key {
            return self.get(old_key).map(|_| ());
        }
        if new_key.is_empty() {
            return Err(CollectionError::EmptyPackageKey);
        }
        let position = self.position(old_key)?;

        if let Some(&target) = self.index.get(new_key) {
            log::debug!("PackageCollection: Merging package '{old_key}' into '{new_key}'.");
            self.check_merge(target, &self.packages[position])?;
            let package = self.packages.remove(position);
            let target = if target > position { target - 1 } else { target };
            self.merge_into(target, package)?;
            self.reindex();
            return Ok(());
        }

        log::debug!("PackageCollection: Renaming package '{old_key}' to '{new_key}'.");
        self.packages[position].set_key(new_key.to_string())?;
        self.index.remove(old_key);
        self.index.insert(new_key.to_string(), position);
        Ok(())
    }

    /*
     * Applies several renames at once. Every renamed package is detached under its old key
     * before any is re-inserted, so with `a -> b` and `b -> c` the resources of `a` end up
     * in `b` and those of `b` in `c`, never all in `c`. Packages sharing a new key merge.
     */
    pub fn rekey_all(&mut self, renames: &[(String, String)]) -> Result<(), CollectionError> {
        if renames.iter().any(|(_, new_key)| new_key.is_empty()) {
            return Err(CollectionError::EmptyPackageKey);
        }
        for (old_key, _) in renames {
            self.position(old_key)?;
        }
        let mut detached = Vec::with_capacity(renames.len());
        for (old_key, new_key) in renames {
            let position = self.position(old_key)?;
            detached.push((self.packages.remove(position), new_key));
            self.reindex();
        }
        for (mut package, new_key) in detached {
            if let Some(&target) = self.index.get(new_key.as_str()) {
                log::debug!("PackageCollection: Merging package '{package}' into '{new_key}'.");
                self.merge_into(target, package)?;
                continue;
            }
            log::debug!("PackageCollection: Renaming package '{package}' to '{new_key}'.");
            package.set_key(new_key.clone())?;
            self.add(package)?;
        }
        Ok(())
    }

    fn position(&self, key: &str) -> Result<usize, CollectionError> {
        self.index
            .get(key)
            .copied()
            .ok_or_else(|| CollectionError::PackageNotInCollection(key.to_string()))
    }

    fn check_merge(&self, target: usize, package: &Package) -> Result<(), CollectionError> {
        for resource in package.resources.iter() {
            if self.packages[target].resources.has(&resource.key()) {
                return Err(CollectionError::ResourceAlreadyInCollection(resource.key()));
            }
        }
        Ok(())
    }

    fn merge_into(&mut self, target: usize, package: Package) -> Result<(), CollectionError> {
        self.check_merge(target, &package)?;
        for resource in package.resources.into_vec() {
            self.packages[target].resources.add(resource)?;
        }
        Ok(())
    }

    fn reindex(&mut self) {
        self.index = self
            .packages
            .iter()
            .enumerate()
            .map(|(position, package)| (package.key().to_string(), position))
            .collect();
    }

    pub fn keys(&self) -> Vec<String> {
        self.packages.iter().map(|p| p.key().to_string()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Package> {
        self.packages.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Package> {
        self.packages.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn resource_count(&self) -> usize {
        self.packages.iter().map(|p| p.resources().len()).sum()
    }
}

impl<'a> IntoIterator for &'a PackageCollection {
    type Item = &'a Package;
    type IntoIter = std::slice::Iter<'a, Package>;

    fn into_iter(self) -> Self::IntoIter {
        self.packages.iter()
    }
}
