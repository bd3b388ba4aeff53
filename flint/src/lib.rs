// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

pub use self::builder::Builder;
pub use self::package::{Catalog, Package, PackageType, PkgName};
pub use self::paths::{BuildName, Paths};
pub use self::project::Project;
pub use self::resolver::Resolution;
pub use self::syscfg::Syscfg;
pub use self::target::Target;
pub use self::toolchain::Toolchain;

pub mod builder;
pub mod package;
pub mod paths;
pub mod project;
pub mod relink;
pub mod resolver;
pub mod size;
pub mod stage;
pub mod syscfg;
pub mod target;
pub mod toolchain;
pub mod util;
