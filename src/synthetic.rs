//! Rotating-Gaussians gradual shift benchmark.
//!
//! Two isotropic Gaussian classes centred at `(-separation, 0)` and
//! `(separation, 0)`. Domain `d` of `n` rotates every point by
//! `max_angle_deg * d / (n - 1)`; domain 0 is the labelled source. Example ids
//! run densely across all domains in order.

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::data::InMemoryLoader;
use crate::error::{AdaptError, Result};

/// Generator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Domains including the source.
    pub num_domains: usize,
    /// Examples per domain, split evenly between the classes.
    pub examples_per_domain: usize,
    /// Rotation of the last domain, in degrees.
    pub max_angle_deg: f64,
    /// Half the distance between class means.
    pub separation: f64,
    /// Per-coordinate standard deviation.
    pub noise_std: f64,
    /// Random seed.
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_domains: 6,
            examples_per_domain: 400,
            max_angle_deg: 90.0,
            separation: 1.0,
            noise_std: 0.35,
            seed: 42,
        }
    }
}

/// Data of one domain.
#[derive(Debug, Clone)]
pub struct DomainData {
    /// Domain index, 0 for the source.
    pub index: usize,
    /// Rotation applied, in degrees.
    pub angle_deg: f64,
    /// Global example ids.
    pub ids: Vec<u32>,
    /// `(n, 2)` f32 points.
    pub inputs: Tensor,
    /// `(n,)` u32 classes.
    pub labels: Tensor,
}

impl DomainData {
    /// Loader over the domain, keeping the labels for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns an error if `batch_size` is zero.
    pub fn loader(&self, batch_size: usize, device: &Device) -> Result<InMemoryLoader> {
        InMemoryLoader::new(
            self.ids.clone(),
            self.inputs.clone(),
            Some(self.labels.clone()),
            batch_size,
            device,
        )
    }
}

/// Generate every domain.
///
/// # Errors
///
/// Returns [`AdaptError::Config`] for fewer than two domains or no examples.
pub fn rotating_gaussians(config: &SyntheticConfig, device: &Device) -> Result<Vec<DomainData>> {
    if config.num_domains < 2 || config.examples_per_domain == 0 {
        return Err(AdaptError::Config(
            "need at least two domains with examples".into(),
        ));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let n = config.examples_per_domain;

    let mut domains = Vec::with_capacity(config.num_domains);
    for d in 0..config.num_domains {
        let angle_deg = config.max_angle_deg * d as f64 / (config.num_domains - 1) as f64;
        let (sin, cos) = angle_deg.to_radians().sin_cos();

        let mut points = Vec::with_capacity(n * 2);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let class = (i % 2) as u32;
            let centre = if class == 0 { -config.separation } else { config.separation };
            let x = centre + config.noise_std * rng.sample::<f64, _>(StandardNormal);
            let y = config.noise_std * rng.sample::<f64, _>(StandardNormal);
            points.push((x * cos - y * sin) as f32);
            points.push((x * sin + y * cos) as f32);
            labels.push(class);
        }

        let first = (d * n) as u32;
        domains.push(DomainData {
            index: d,
            angle_deg,
            ids: (first..first + n as u32).collect(),
            inputs: Tensor::from_vec(points, (n, 2), device)?,
            labels: Tensor::from_vec(labels, n, device)?,
        });
    }
    Ok(domains)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_dense_across_domains() {
        let config = SyntheticConfig {
            num_domains: 3,
            examples_per_domain: 4,
            ..Default::default()
        };
        let domains = rotating_gaussians(&config, &Device::Cpu).unwrap();
        let ids: Vec<u32> = domains.iter().flat_map(|d| d.ids.clone()).collect();
        assert_eq!(ids, (0..12).collect::<Vec<u32>>());
        assert_eq!(domains[2].angle_deg, config.max_angle_deg);
    }

    #[test]
    fn test_same_seed_same_data() {
        let config = SyntheticConfig::default();
        let a = rotating_gaussians(&config, &Device::Cpu).unwrap();
        let b = rotating_gaussians(&config, &Device::Cpu).unwrap();
        assert_eq!(
            a[3].inputs.to_vec2::<f32>().unwrap(),
            b[3].inputs.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_rotation_moves_class_means() {
        let config = SyntheticConfig {
            num_domains: 2,
            examples_per_domain: 2000,
            max_angle_deg: 90.0,
            noise_std: 0.1,
            ..Default::default()
        };
        let domains = rotating_gaussians(&config, &Device::Cpu).unwrap();
        let rotated = domains[1].inputs.to_vec2::<f32>().unwrap();
        let class_one: Vec<&Vec<f32>> = rotated.iter().skip(1).step_by(2).collect();
        let mean_y = class_one.iter().map(|p| f64::from(p[1])).sum::<f64>() / class_one.len() as f64;
        let mean_x = class_one.iter().map(|p| f64::from(p[0])).sum::<f64>() / class_one.len() as f64;
        assert!((mean_y - 1.0).abs() < 0.05);
        assert!(mean_x.abs() < 0.05);
    }

    #[test]
    fn test_single_domain_rejected() {
        let config = SyntheticConfig {
            num_domains: 1,
            ..Default::default()
        };
        assert!(rotating_gaussians(&config, &Device::Cpu).is_err());
    }
}
