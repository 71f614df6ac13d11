//! Typed kernel parameters: by-value scalars and device-buffer pointers,
//! with direction, batching and placeholder support.

use std::sync::{Arc, Mutex};

use crate::driver::Driver;
use crate::error::{Error, Result};

/// Host/device transfer direction of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Not passed to the kernel at all.
    None,
    In,
    Out,
    InOut,
    /// Already resident on the device; no copies are issued.
    Present,
}

impl Direction {
    pub fn is_in(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    pub fn is_out(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Value,
    Pointer,
}

/// C-side type of a parameter, rendered into the generated kernel source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDesc {
    pub base: String,
    pub is_pointer: bool,
    pub is_const: bool,
}

impl TypeDesc {
    pub fn scalar(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            is_pointer: false,
            is_const: false,
        }
    }

    pub fn pointer(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            is_pointer: true,
            is_const: false,
        }
    }

    /// Full C spelling, including the `*` for pointers.
    pub fn full_name(&self) -> String {
        if self.is_pointer {
            format!("{}*", self.base)
        } else {
            self.base.clone()
        }
    }

    /// Element type for pointers, the type itself otherwise.
    pub fn scalar_name(&self) -> &str {
        &self.base
    }
}

/// Maps Rust scalar types onto the C type names used in generated kernels.
pub trait KernelArg: Copy + 'static {
    const DEVICE_TYPE: &'static str;
}

macro_rules! kernel_arg {
    ($($rust:ty => $c:expr),* $(,)?) => {
        $(impl KernelArg for $rust {
            const DEVICE_TYPE: &'static str = $c;
        })*
    };
}

kernel_arg! {
    i8 => "char",
    u8 => "unsigned char",
    i16 => "short",
    u16 => "unsigned short",
    i32 => "int",
    u32 => "unsigned int",
    i64 => "long",
    u64 => "unsigned long",
    f32 => "float",
    f64 => "double",
}

/// Host-side backing of a parameter.
pub(crate) enum HostBinding {
    /// Placeholder: nothing bound yet.
    None,
    /// Scalar bytes, owned by the parameter.
    Value(Vec<u8>),
    /// Caller-owned buffer. For batched value parameters this is the
    /// flattened array of per-batch scalars.
    Pointer(*mut u8),
    /// One caller-owned buffer per batch chunk.
    Pointers(Vec<*mut u8>),
    /// Buffer owned by the parameter itself (Reduce partial totals).
    Owned(Vec<u8>),
}

/// Device-side backing of a parameter, created lazily on first run.
pub(crate) enum DeviceBinding<D: Driver> {
    None,
    Memory(D::Memory),
    Chunked(D::ChunkedMemory),
    /// User-supplied memory object, shared with the caller (PRESENT).
    Shared(Arc<Mutex<D::Memory>>),
}

/// A registered kernel parameter.
pub struct Parameter<D: Driver> {
    pub name: String,
    pub ty: TypeDesc,
    /// Declared byte size. For batched pointer parameters this is the size
    /// of one chunk; the flattened size of batched values is derived from
    /// the batch size at allocation time.
    pub size: usize,
    pub kind: ParamKind,
    pub direction: Direction,
    pub batched: bool,
    complete: bool,
    pub(crate) host: HostBinding,
    pub(crate) device: DeviceBinding<D>,
}

// Host pointers are owned by the caller, who guarantees they stay valid and
// unaliased for the duration of every run of the owning pattern. Device
// bindings follow the backend's own Send rules.
unsafe impl<D: Driver> Send for Parameter<D> {}

impl<D: Driver> Parameter<D> {
    /// By-value scalar parameter.
    pub fn value<T: KernelArg>(name: impl Into<String>, value: T) -> Self {
        let bytes = value_bytes(&value);
        Self {
            name: name.into(),
            ty: TypeDesc::scalar(T::DEVICE_TYPE),
            size: std::mem::size_of::<T>(),
            kind: ParamKind::Value,
            direction: Direction::In,
            batched: false,
            complete: true,
            host: HostBinding::Value(bytes),
            device: DeviceBinding::None,
        }
    }

    /// Device-buffer parameter backed by a caller-owned host region of
    /// `count` elements.
    pub fn pointer<T: KernelArg>(
        name: impl Into<String>,
        ptr: *mut T,
        count: usize,
        direction: Direction,
    ) -> Result<Self> {
        let name = name.into();
        if direction == Direction::Present {
            return Err(Error::PresentWithoutMemory(name));
        }
        Ok(Self {
            name,
            ty: TypeDesc::pointer(T::DEVICE_TYPE),
            size: count * std::mem::size_of::<T>(),
            kind: ParamKind::Pointer,
            direction,
            batched: false,
            complete: true,
            host: HostBinding::Pointer(ptr.cast()),
            device: DeviceBinding::None,
        })
    }

    /// Parameter backed by an existing device memory object; implies
    /// PRESENT and issues no host copies.
    pub fn from_memory<T: KernelArg>(
        name: impl Into<String>,
        memory: Arc<Mutex<D::Memory>>,
        size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            ty: TypeDesc::pointer(T::DEVICE_TYPE),
            size,
            kind: ParamKind::Pointer,
            direction: Direction::Present,
            batched: false,
            complete: true,
            host: HostBinding::None,
            device: DeviceBinding::Shared(memory),
        }
    }

    /// Declares a parameter for source generation before its value exists.
    pub fn placeholder<T: KernelArg>(
        name: impl Into<String>,
        kind: ParamKind,
        direction: Direction,
        batched: bool,
    ) -> Self {
        let ty = match kind {
            ParamKind::Value => TypeDesc::scalar(T::DEVICE_TYPE),
            ParamKind::Pointer => TypeDesc::pointer(T::DEVICE_TYPE),
        };
        Self {
            name: name.into(),
            ty,
            size: std::mem::size_of::<T>(),
            kind,
            direction,
            batched,
            complete: false,
            host: HostBinding::None,
            device: DeviceBinding::None,
        }
    }

    /// Batched pointer parameter: one caller-owned chunk of
    /// `count_per_chunk` elements per batch instance.
    pub fn batched_pointer<T: KernelArg>(
        name: impl Into<String>,
        chunks: &[*mut T],
        count_per_chunk: usize,
        direction: Direction,
    ) -> Result<Self> {
        let name = name.into();
        if direction == Direction::Present {
            return Err(Error::PresentWithoutMemory(name));
        }
        Ok(Self {
            name,
            ty: TypeDesc::pointer(T::DEVICE_TYPE),
            size: count_per_chunk * std::mem::size_of::<T>(),
            kind: ParamKind::Pointer,
            direction,
            batched: true,
            complete: true,
            host: HostBinding::Pointers(chunks.iter().map(|p| p.cast::<u8>()).collect()),
            device: DeviceBinding::None,
        })
    }

    /// Batched value parameter: `values` points at one scalar per batch
    /// instance, flattened into a single device buffer.
    pub fn batched_value<T: KernelArg>(name: impl Into<String>, values: *mut T) -> Self {
        Self {
            name: name.into(),
            ty: TypeDesc::scalar(T::DEVICE_TYPE),
            size: std::mem::size_of::<T>(),
            kind: ParamKind::Value,
            direction: Direction::In,
            batched: true,
            complete: true,
            host: HostBinding::Pointer(values.cast()),
            device: DeviceBinding::None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub(crate) fn set_complete(&mut self, complete: bool) {
        self.complete = complete;
    }

    /// Identifier the parameter is declared under in the generated
    /// parameter list. Batched parameters are renamed so the in-kernel name
    /// can be rebound to the per-batch view.
    pub fn kernel_parameter_name(&self) -> String {
        if self.batched {
            format!("motif_batched_{}", self.name)
        } else {
            self.name.clone()
        }
    }

    /// Renders the `type name` pair for the kernel parameter list. A
    /// batched value parameter is passed as a pointer to per-batch values.
    pub fn to_kernel_parameter(&self) -> String {
        let mut ty = self.ty.full_name();
        if self.batched && self.kind == ParamKind::Value {
            ty.push('*');
        }
        format!("{} {}", ty, self.kernel_parameter_name())
    }

    /// Byte size of the device allocation this parameter needs for the
    /// given batch size.
    pub(crate) fn allocation_size(&self, batch_size: usize) -> usize {
        if self.batched && self.kind == ParamKind::Value {
            self.size * batch_size.max(1)
        } else {
            self.size
        }
    }
}

pub(crate) fn value_bytes<T: Copy>(value: &T) -> Vec<u8> {
    // T is a plain scalar; reading its bytes is well defined.
    let ptr = value as *const T as *const u8;
    unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<T>()) }.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::dummy::Dummy;

    #[test]
    fn value_parameter_is_complete() {
        let p = Parameter::<Dummy>::value("n", 42i32);
        assert!(p.is_complete());
        assert_eq!(p.ty.full_name(), "int");
        assert_eq!(p.to_kernel_parameter(), "int n");
    }

    #[test]
    fn placeholder_is_incomplete_until_bound() {
        let p = Parameter::<Dummy>::placeholder::<f32>(
            "a",
            ParamKind::Pointer,
            Direction::In,
            false,
        );
        assert!(!p.is_complete());
        assert_eq!(p.to_kernel_parameter(), "float* a");
    }

    #[test]
    fn batched_parameters_are_renamed() {
        let mut chunk = [0.0f64; 4];
        let ptrs = [chunk.as_mut_ptr()];
        let p = Parameter::<Dummy>::batched_pointer("v", &ptrs, 4, Direction::InOut).unwrap();
        assert_eq!(p.kernel_parameter_name(), "motif_batched_v");
        assert_eq!(p.to_kernel_parameter(), "double* motif_batched_v");
    }

    #[test]
    fn batched_value_is_passed_as_pointer() {
        let mut vals = [1i32, 2, 3];
        let p = Parameter::<Dummy>::batched_value("n", vals.as_mut_ptr());
        assert_eq!(p.to_kernel_parameter(), "int* motif_batched_n");
        assert_eq!(p.allocation_size(3), 12);
    }

    #[test]
    fn present_requires_memory_object() {
        let mut data = [0i32; 8];
        let err = Parameter::<Dummy>::pointer("a", data.as_mut_ptr(), 8, Direction::Present);
        assert!(matches!(err, Err(Error::PresentWithoutMemory(_))));
    }
}
