#![allow(non_upper_case_globals)]

use atomig::Atom;

/// Class of hardware queue a unit of work is recorded for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Engine {
    Graphics = 0,
    Compute = 1,
    Copy = 2,
    /// Runs on its own queue of the direct type.
    RayTracing = 3,
}

impl Engine {
    pub const COUNT: usize = 4;
    pub const ALL: [Engine; Engine::COUNT] = [
        Engine::Graphics,
        Engine::Compute,
        Engine::Copy,
        Engine::RayTracing,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn mask(self) -> EngineMask {
        EngineMask::from_bits_retain(1 << self.index())
    }

    pub fn queue_kind(self) -> QueueKind {
        match self {
            Engine::Graphics | Engine::RayTracing => QueueKind::Direct,
            Engine::Compute => QueueKind::Compute,
            Engine::Copy => QueueKind::Copy,
        }
    }

    /// Whether root bindings go through the graphics or the compute root signature.
    pub(crate) fn uses_graphics_root(self) -> bool {
        matches!(self, Engine::Graphics)
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct EngineMask: u32 {
        const Graphics = 1;
        const Compute = 2;
        const Copy = 4;
        const RayTracing = 8;
        const All = 15;
    }
}

impl EngineMask {
    pub fn engines(self) -> impl Iterator<Item = Engine> {
        Engine::ALL
            .into_iter()
            .filter(move |engine| self.contains(engine.mask()))
    }
}

impl From<Engine> for EngineMask {
    fn from(value: Engine) -> Self {
        value.mask()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Direct,
    Compute,
    Copy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryHeapType {
    Gpu,
    Cpu,
    Readback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    Rtv,
    Dsv,
    CbvSrvUav,
    Sampler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Cbv,
    Srv,
    Uav,
    Rtv,
    Dsv,
    Sampler,
}

impl ViewKind {
    pub fn heap_kind(self) -> DescriptorHeapKind {
        match self {
            ViewKind::Cbv | ViewKind::Srv | ViewKind::Uav => DescriptorHeapKind::CbvSrvUav,
            ViewKind::Rtv => DescriptorHeapKind::Rtv,
            ViewKind::Dsv => DescriptorHeapKind::Dsv,
            ViewKind::Sampler => DescriptorHeapKind::Sampler,
        }
    }
}

// Values match D3D12_RESOURCE_STATES so backends can pass them through.
bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    pub struct ResourceStates: u32 {
        const Common = 0;
        const VertexAndConstantBuffer = 0x1;
        const IndexBuffer = 0x2;
        const RenderTarget = 0x4;
        const UnorderedAccess = 0x8;
        const DepthWrite = 0x10;
        const DepthRead = 0x20;
        const NonPixelShaderResource = 0x40;
        const PixelShaderResource = 0x80;
        const IndirectArgument = 0x200;
        const CopyDst = 0x400;
        const CopySrc = 0x800;
        const RaytracingAccelerationStructure = 0x400000;
        const GenericRead = 0x1 | 0x2 | 0x40 | 0x80 | 0x200 | 0x800;
        const AllShaderResource = 0x40 | 0x80;
        const Present = 0;
    }
}

impl ResourceStates {
    /// State a shader-resource view needs when read from `engine`.
    pub fn shader_resource_for(engine: Engine) -> Self {
        match engine {
            Engine::Graphics => {
                ResourceStates::NonPixelShaderResource | ResourceStates::PixelShaderResource
            }
            _ => ResourceStates::NonPixelShaderResource,
        }
    }
}

impl Atom for ResourceStates {
    type Repr = u32;

    fn pack(self) -> Self::Repr {
        self.bits()
    }

    fn unpack(src: Self::Repr) -> Self {
        ResourceStates::from_bits_retain(src)
    }
}
