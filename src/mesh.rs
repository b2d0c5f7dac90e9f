//! Mesh planner: maps a logical accelerator topology onto physical devices.
//!
//! A [`Mesh`] is a named multi-dimensional grid of devices. Devices are
//! ordered by id and laid out row-major over the axes, so re-creating a mesh
//! from the same shape and device set always yields the same placement.

use crate::config::TrainerConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A single accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    pub id: usize,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.id)
    }
}

/// The set of accelerators available to this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    /// `count` local devices with ids `0..count`.
    pub fn local(count: usize) -> Self {
        Self {
            devices: (0..count).map(|id| Device { id }).collect(),
        }
    }

    pub fn from_devices(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
}

/// A named mesh axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshAxis {
    pub name: String,
    pub size: usize,
}

/// Named grid of devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mesh {
    axes: Vec<MeshAxis>,
    /// Devices in row-major coordinate order
    devices: Vec<Device>,
}

impl Mesh {
    /// Build a mesh of `shape` over `devices`, naming each axis.
    pub fn new<S: AsRef<str>>(shape: &[usize], axis_names: &[S], devices: &DeviceSet) -> Result<Self> {
        if shape.is_empty() {
            return Err(Error::config("mesh shape must have at least one axis"));
        }
        if shape.len() != axis_names.len() {
            return Err(Error::config(format!(
                "mesh shape {:?} has rank {} but {} axis names were given",
                shape,
                shape.len(),
                axis_names.len()
            )));
        }
        if shape.iter().any(|&s| s == 0) {
            return Err(Error::config(format!(
                "mesh shape {:?} has an empty axis",
                shape
            )));
        }

        let mut seen = HashSet::new();
        for name in axis_names {
            let name = name.as_ref();
            if name.is_empty() {
                return Err(Error::config("mesh axis names must not be empty"));
            }
            if !seen.insert(name) {
                return Err(Error::config(format!("duplicate mesh axis '{}'", name)));
            }
        }

        let product: usize = shape.iter().product();
        if product != devices.len() {
            return Err(Error::config(format!(
                "mesh shape {:?} needs {} devices but {} are available",
                shape,
                product,
                devices.len()
            )));
        }

        let mut ordered = devices.devices().to_vec();
        ordered.sort();
        ordered.dedup();
        if ordered.len() != devices.len() {
            return Err(Error::config("device set contains duplicate device ids"));
        }

        let axes = shape
            .iter()
            .zip(axis_names)
            .map(|(&size, name)| MeshAxis {
                name: name.as_ref().to_string(),
                size,
            })
            .collect();

        Ok(Self {
            axes,
            devices: ordered,
        })
    }

    /// Build the mesh described by a trainer config.
    pub fn from_config(config: &TrainerConfig, devices: &DeviceSet) -> Result<Self> {
        let shape = config.resolved_mesh_shape()?;
        let mesh = Self::new(&shape, &config.mesh_axis_names, devices)?;
        tracing::info!(
            "Created device mesh {} over {} devices",
            mesh,
            mesh.size()
        );
        Ok(mesh)
    }

    pub fn axes(&self) -> &[MeshAxis] {
        &self.axes
    }

    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.size).collect()
    }

    pub fn axis_names(&self) -> Vec<&str> {
        self.axes.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn size(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn axis_index(&self, name: &str) -> Option<usize> {
        self.axes.iter().position(|a| a.name == name)
    }

    pub fn axis_size(&self, name: &str) -> Option<usize> {
        self.axes.iter().find(|a| a.name == name).map(|a| a.size)
    }

    pub fn has_axis(&self, name: &str) -> bool {
        self.axis_index(name).is_some()
    }

    /// Product of the sizes of the named axes.
    pub fn degree<S: AsRef<str>>(&self, axes: &[S]) -> Result<usize> {
        axes.iter().try_fold(1usize, |acc, name| {
            self.axis_size(name.as_ref())
                .map(|size| acc * size)
                .ok_or_else(|| Error::sharding(format!("unknown mesh axis '{}'", name.as_ref())))
        })
    }

    /// Coordinates of the device at row-major position `linear`.
    fn coords_of_linear(&self, mut linear: usize) -> Vec<usize> {
        let mut coords = vec![0; self.axes.len()];
        for (d, axis) in self.axes.iter().enumerate().rev() {
            coords[d] = linear % axis.size;
            linear /= axis.size;
        }
        coords
    }

    pub fn coords_of(&self, device: Device) -> Option<Vec<usize>> {
        self.devices
            .binary_search(&device)
            .ok()
            .map(|linear| self.coords_of_linear(linear))
    }

    pub fn device_at(&self, coords: &[usize]) -> Option<Device> {
        if coords.len() != self.axes.len() {
            return None;
        }
        let mut linear = 0;
        for (c, axis) in coords.iter().zip(&self.axes) {
            if *c >= axis.size {
                return None;
            }
            linear = linear * axis.size + c;
        }
        self.devices.get(linear).copied()
    }

    /// Every device with its coordinates, in row-major order.
    pub fn placements(&self) -> impl Iterator<Item = (Device, Vec<usize>)> + '_ {
        self.devices
            .iter()
            .enumerate()
            .map(move |(linear, &device)| (device, self.coords_of_linear(linear)))
    }

    /// Index of the data-parallel group `device` belongs to, counting
    /// row-major over `axes`.
    pub fn group_index<S: AsRef<str>>(&self, device: Device, axes: &[S]) -> Result<usize> {
        let coords = self
            .coords_of(device)
            .ok_or_else(|| Error::sharding(format!("{} is not part of the mesh", device)))?;
        let mut index = 0;
        for name in axes {
            let d = self
                .axis_index(name.as_ref())
                .ok_or_else(|| Error::sharding(format!("unknown mesh axis '{}'", name.as_ref())))?;
            index = index * self.axes[d].size + coords[d];
        }
        Ok(index)
    }
}

impl fmt::Display for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .axes
            .iter()
            .map(|a| format!("{}={}", a.name, a.size))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AXES: [&str; 3] = ["replica", "data", "model"];

    #[test]
    fn test_mesh_covers_every_device_once() {
        for shape in [[1, 2, 4], [2, 2, 2], [1, 1, 8], [8, 1, 1], [2, 4, 1]] {
            let mesh = Mesh::new(&shape, &AXES, &DeviceSet::local(8)).unwrap();
            let mut seen = HashSet::new();
            for (device, coords) in mesh.placements() {
                assert!(seen.insert(device));
                assert_eq!(mesh.device_at(&coords), Some(device));
                assert_eq!(mesh.coords_of(device), Some(coords));
            }
            assert_eq!(seen.len(), 8);
        }
    }

    #[test]
    fn test_mesh_shape_mismatch() {
        let err = Mesh::new(&[1, 2, 4], &AXES, &DeviceSet::local(4)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Mesh::new(&[2, 4], &AXES, &DeviceSet::local(8)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Mesh::new(&[2, 4], &["data", "data"], &DeviceSet::local(8)).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_placement_is_deterministic() {
        let shuffled = DeviceSet::from_devices(
            [5, 2, 7, 0, 1, 6, 3, 4].iter().map(|&id| Device { id }).collect(),
        );
        let a = Mesh::new(&[1, 2, 4], &AXES, &shuffled).unwrap();
        let b = Mesh::new(&[1, 2, 4], &AXES, &DeviceSet::local(8)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.coords_of(Device { id: 5 }), Some(vec![0, 1, 1]));
    }

    #[test]
    fn test_axis_queries() {
        let mesh = Mesh::new(&[1, 2, 4], &AXES, &DeviceSet::local(8)).unwrap();
        assert_eq!(mesh.axis_size("model"), Some(4));
        assert_eq!(mesh.degree(&["replica", "data"]).unwrap(), 2);
        assert!(mesh.degree(&["pipeline"]).is_err());
        assert_eq!(mesh.group_index(Device { id: 6 }, &["replica", "data"]).unwrap(), 1);
        assert_eq!(mesh.to_string(), "[replica=1, data=2, model=4]");
    }
}
