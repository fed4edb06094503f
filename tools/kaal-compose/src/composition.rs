//! Composition orchestrator
//!
//! A [`Composition`] owns the context and the registered components, and
//! drives them through the phases:
//!
//! 1. the caller's compose step creates components (construction)
//! 2. every component runs `pre_finalize`, then every component runs
//!    `finalize`, both in registration order
//! 3. ASID pools get their slots and, if enabled, every object is placed in
//!    an untyped object
//! 4. `spec.cdl`, `spec.json`, `links/` and `links.json` are written

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::asid::assign_asid_slots;
use crate::component::Composable;
use crate::config::{ComposeConfig, PlatformInfo};
use crate::context::{CompositionContext, Phase};
use crate::error::{ComposeError, Result};
use crate::spec::Object;
use crate::untyped::{CoverReport, UntypedAllocator};

/// What a completed composition produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub components: usize,
    pub objects: usize,
    pub files: usize,
    pub asid_pools: usize,
    /// Present if untyped covering ran
    pub untyped: Option<CoverReport>,
}

/// A system being composed
pub struct Composition {
    ctx: CompositionContext,
    components: Vec<Box<dyn Composable>>,
    platform_info: Option<PlatformInfo>,
    compute_ut_covers: bool,
    expose_spare_untypeds: bool,
}

impl Composition {
    /// A composition without untyped covering
    pub fn new(ctx: CompositionContext) -> Self {
        Self {
            ctx,
            components: Vec::new(),
            platform_info: None,
            compute_ut_covers: false,
            expose_spare_untypeds: false,
        }
    }

    /// A composition configured by `config`, writing to `out_dir`
    ///
    /// # Errors
    /// Configuration errors from [`ComposeConfig::validate`]
    pub fn from_config(config: &ComposeConfig, out_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut composition = Self::new(config.context(out_dir)?);
        if config.compute_ut_covers {
            let platform_info = config
                .platform_info
                .clone()
                .ok_or_else(|| ComposeError::MissingKey("platform_info".into()))?;
            composition = composition.with_untyped_covers(platform_info, config.expose_spare_untypeds);
        }
        Ok(composition)
    }

    /// Place every object in untyped memory from `platform_info`
    pub fn with_untyped_covers(mut self, platform_info: PlatformInfo, expose_spares: bool) -> Self {
        self.platform_info = Some(platform_info);
        self.compute_ut_covers = true;
        self.expose_spare_untypeds = expose_spares;
        self
    }

    pub fn context(&self) -> &CompositionContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut CompositionContext {
        &mut self.ctx
    }

    pub fn out_dir(&self) -> &Path {
        self.ctx.out_dir()
    }

    /// Registered components, in registration order
    pub fn components(&self) -> impl Iterator<Item = &dyn Composable> {
        self.components.iter().map(|c| c.as_ref())
    }

    /// Add a component to the composition
    ///
    /// # Errors
    /// Returns `LifecycleViolation` outside the construction phase
    pub fn register_component(&mut self, component: impl Composable + 'static) -> Result<()> {
        self.ctx
            .ensure_phase(component.name(), "register", Phase::Construction)?;
        log::debug!("registered component {}", component.name());
        self.components.push(Box::new(component));
        Ok(())
    }

    /// Construct a component with `make` and register it
    ///
    /// # Errors
    /// Errors from `make`, or `LifecycleViolation` outside the construction
    /// phase
    pub fn component<C, F>(&mut self, make: F) -> Result<()>
    where
        C: Composable + 'static,
        F: FnOnce(&mut CompositionContext) -> Result<C>,
    {
        let component = make(&mut self.ctx)?;
        self.register_component(component)
    }

    /// Run `compose` to build the components, then complete the composition
    pub fn run<F>(&mut self, compose: F) -> Result<Summary>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        fs::create_dir_all(self.out_dir()).map_err(|e| ComposeError::io(self.out_dir(), e))?;
        compose(self)?;
        self.complete()
    }

    /// Finalize, allocate and write every output
    pub fn complete(&mut self) -> Result<Summary> {
        self.finalize()?;
        let (asid_pools, untyped) = self.allocate()?;
        self.write_spec()?;
        self.write_links()?;
        self.ctx.enter_phase(Phase::Complete)?;

        let summary = Summary {
            components: self.components.len(),
            objects: self.ctx.objects().len(),
            files: self.ctx.files().len(),
            asid_pools,
            untyped,
        };
        log::info!(
            "Composed {} components: {} objects, {} files",
            summary.components,
            summary.objects,
            summary.files
        );
        Ok(summary)
    }

    /// Pre-finalize every component, then finalize every component
    pub fn finalize(&mut self) -> Result<()> {
        fs::create_dir_all(self.ctx.out_dir()).map_err(|e| ComposeError::io(self.ctx.out_dir(), e))?;

        self.ctx.enter_phase(Phase::PreFinalize)?;
        for component in &mut self.components {
            log::debug!("pre_finalize {}", component.name());
            component.pre_finalize(&mut self.ctx)?;
        }

        self.ctx.enter_phase(Phase::Finalize)?;
        for component in &mut self.components {
            log::debug!("finalize {}", component.name());
            component.finalize(&mut self.ctx)?;
        }
        self.ensure_cspaces_sized()
    }

    /// A capability table left unsized belongs to a component that was
    /// created but never registered
    fn ensure_cspaces_sized(&self) -> Result<()> {
        let unsized_cnode = self
            .ctx
            .objects()
            .spec()
            .iter()
            .find(|(_, named)| matches!(named.object, Object::CNode { size_bits: None, .. }));
        match unsized_cnode {
            Some((_, named)) => Err(ComposeError::UnsizedCNode(named.name.clone())),
            None => Ok(()),
        }
    }

    /// Assign ASID slots and, if enabled, cover objects with untyped memory
    ///
    /// Returns the number of ASID pools and the covering report.
    pub fn allocate(&mut self) -> Result<(usize, Option<CoverReport>)> {
        self.ctx.enter_phase(Phase::Allocation)?;

        let limit = self.ctx.kernel_config().arch().asid_pool_limit();
        let asid_pools = assign_asid_slots(self.ctx.objects_mut(), limit)?;

        if !self.compute_ut_covers {
            return Ok((asid_pools, None));
        }

        let info = self
            .platform_info
            .as_ref()
            .ok_or_else(|| ComposeError::MissingKey("platform_info".into()))?;
        let mut allocator = UntypedAllocator::new(self.ctx.kernel_config().word_size());
        for region in &info.memory {
            allocator.add_region(region.start, region.end, false);
        }
        for region in &info.devices {
            allocator.add_region(region.start, region.end, true);
        }

        let sizes = self.ctx.object_sizes().clone();
        let report = allocator.allocate(self.ctx.objects_mut(), &sizes, self.expose_spare_untypeds)?;
        Ok((asid_pools, Some(report)))
    }

    /// Write `spec.cdl` and `spec.json`
    ///
    /// # Errors
    /// `UnsizedCNode` if a component was never registered
    pub fn write_spec(&self) -> Result<()> {
        self.ensure_cspaces_sized()?;
        let spec = self.ctx.objects().spec();

        let cdl = self.ctx.out_path("spec.cdl");
        fs::write(&cdl, spec.to_string()).map_err(|e| ComposeError::io(&cdl, e))?;

        let json = self.ctx.out_path("spec.json");
        fs::write(&json, spec.to_json()?).map_err(|e| ComposeError::io(&json, e))?;

        log::info!("Wrote {} and {}", cdl.display(), json.display());
        Ok(())
    }

    /// Recreate `links/` with one link per registered file, and `links.json`
    pub fn write_links(&self) -> Result<()> {
        let links_dir = self.ctx.out_path("links");
        if links_dir.exists() {
            fs::remove_dir_all(&links_dir).map_err(|e| ComposeError::io(&links_dir, e))?;
        }
        fs::create_dir_all(&links_dir).map_err(|e| ComposeError::io(&links_dir, e))?;

        let mut manifest = BTreeMap::new();
        for (fname, path) in self.ctx.files() {
            let target = absolute(path)?;
            let link = links_dir.join(fname);
            link_file(&target, &link)?;
            manifest.insert(fname.clone(), target);
        }

        let manifest_path = self.ctx.out_path("links.json");
        let json = serde_json::to_string_pretty(&manifest)?;
        fs::write(&manifest_path, json).map_err(|e| ComposeError::io(&manifest_path, e))?;

        log::debug!("linked {} files into {}", manifest.len(), links_dir.display());
        Ok(())
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| ComposeError::io(path, e))?;
    Ok(cwd.join(path))
}

#[cfg(unix)]
fn link_file(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| ComposeError::io(link, e))
}

#[cfg(not(unix))]
fn link_file(target: &Path, link: &Path) -> Result<()> {
    fs::copy(target, link).map(|_| ()).map_err(|e| ComposeError::io(link, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, Layoutable, MapOptions};
    use crate::config::Region;
    use crate::error::ErrorKind;
    use crate::kernel_config::{Arch, KernelConfig};
    use crate::spec::Cap;

    fn composition(out_dir: &Path) -> Composition {
        Composition::new(CompositionContext::new(KernelConfig::new(Arch::Aarch64, false), out_dir))
    }

    #[test]
    fn test_complete_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut composition = composition(dir.path());

        let summary = composition
            .run(|c| {
                let ctx = c.context_mut();
                let mut comp = Component::new(ctx, "app")?;
                let ntfn = comp.notification(ctx, "signal")?;
                comp.alloc_cap(Cap::new(ntfn))?;
                comp.map_range(ctx, 0x1000, 0x3000, &MapOptions::labeled("data"))?;
                c.register_component(comp)
            })
            .unwrap();

        assert_eq!(summary.components, 1);
        assert_eq!(summary.untyped, None);
        assert_eq!(composition.context().phase(), Phase::Complete);

        let cdl = fs::read_to_string(dir.path().join("spec.cdl")).unwrap();
        assert!(cdl.contains("app_cspace = cnode (4 bits)"));
        assert!(dir.path().join("spec.json").exists());
        assert!(dir.path().join("links").is_dir());
        assert_eq!(fs::read_to_string(dir.path().join("links.json")).unwrap(), "{}");
    }

    #[test]
    fn test_register_after_construction_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut composition = composition(dir.path());
        let comp = Component::new(composition.context_mut(), "late").unwrap();
        assert!(matches!(composition.finalize(), Err(ComposeError::UnsizedCNode(_))));

        assert!(matches!(
            composition.register_component(comp),
            Err(ComposeError::LifecycleViolation { .. })
        ));
    }

    #[test]
    fn test_complete_twice_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut composition = composition(dir.path());
        composition.complete().unwrap();
        assert!(composition.complete().is_err());
    }

    #[test]
    fn test_untyped_covering() {
        let dir = tempfile::tempdir().unwrap();
        let info = PlatformInfo {
            memory: vec![Region {
                start: 0x4000_0000,
                end: 0x4010_0000,
            }],
            devices: Vec::new(),
        };
        let mut composition = composition(dir.path()).with_untyped_covers(info, false);

        let summary = composition
            .run(|c| {
                let ctx = c.context_mut();
                let mut comp = Component::new(ctx, "app")?;
                let ep = comp.endpoint(ctx, "ep")?;
                comp.alloc_cap(Cap::new(ep))?;
                c.register_component(comp)
            })
            .unwrap();

        let report = summary.untyped.unwrap();
        assert_eq!(report.roots.len(), 1);
        assert_eq!(report.covered, summary.objects - 1);

        let objects = composition.context().objects();
        let root = objects.get(report.roots[0]);
        assert_eq!(root.name, "root_untyped_0x40000000");
        assert!(matches!(root.object, Object::Untyped { .. }));
    }

    #[test]
    fn test_rewrites_links_dir() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("links").join("stale");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"old").unwrap();

        let mut composition = composition(dir.path());
        composition.complete().unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn test_component_constructs_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let mut composition = composition(dir.path());

        let summary = composition
            .run(|c| {
                c.component(|ctx| Component::new(ctx, "first"))?;
                c.component(|ctx| {
                    let mut comp = Component::new(ctx, "second")?;
                    comp.map_page(ctx, 0x1000, &MapOptions::default())?;
                    Ok(comp)
                })
            })
            .unwrap();

        assert_eq!(summary.components, 2);
        let names: Vec<&str> = composition.components().map(|c| c.name()).collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn test_unregistered_component_fails() {
        let dir = tempfile::tempdir().unwrap();
        let info = PlatformInfo {
            memory: vec![Region {
                start: 0x4000_0000,
                end: 0x4010_0000,
            }],
            devices: Vec::new(),
        };
        let mut composition = composition(dir.path()).with_untyped_covers(info, false);

        let err = composition
            .run(|c| {
                c.component(|ctx| Component::new(ctx, "kept"))?;
                let ctx = c.context_mut();
                let mut forgotten = Component::new(ctx, "forgotten")?;
                forgotten.map_page(ctx, 0x1000, &MapOptions::default())?;
                Ok(())
            })
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Lifecycle);
        assert!(matches!(&err, ComposeError::UnsizedCNode(name) if name == "forgotten_cspace"));
        assert!(!dir.path().join("spec.cdl").exists());
        assert!(!dir.path().join("links.json").exists());
    }
}
