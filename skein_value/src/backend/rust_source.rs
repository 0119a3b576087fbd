//! Renders a [`Module`] as Rust source text.
//!
//! Globals become fields of a generated `Memory` struct, external
//! declarations become methods on a generated `Host` trait, and every
//! defined function becomes a free function threading `&mut Memory` and
//! `&mut dyn Host`. Pointer values are raw pointers; loads and stores are
//! `unsafe` element accesses, which is the honest rendering of the emitter
//! contract's memory primitives.

use proc_macro2::TokenStream;
use quote::{format_ident, quote};

use crate::error::BackendError;
use crate::module::{
    BinOp, Block, CmpOp, FunctionBody, GlobalDef, InlineHint, Inst, Module, ValueId, ValueType,
};
use crate::types::{Buffer, ElementType, Scalar};

/// Renders the module to a pretty-printed Rust source file.
pub fn render(module: &Module) -> Result<String, BackendError> {
    let tokens = render_tokens(module)?;
    let file: syn::File = syn::parse2(tokens)
        .map_err(|e| BackendError::MalformedModule(format!("rendered source does not parse: {e}")))?;
    Ok(prettyplease::unparse(&file))
}

/// Renders the module as a token stream.
pub fn render_tokens(module: &Module) -> Result<TokenStream, BackendError> {
    let memory = render_memory(module);
    let host = render_host(module)?;
    let mut functions = TokenStream::new();
    for (_, def) in module.functions() {
        let Some(body) = &def.body else { continue };
        functions.extend(render_function(module, &def.decl, body)?);
    }
    Ok(quote! {
        #memory
        #host
        #functions
    })
}

fn rust_elem(ty: ElementType) -> TokenStream {
    match ty {
        ElementType::Bool => quote!(bool),
        ElementType::I8 => quote!(i8),
        ElementType::I16 => quote!(i16),
        ElementType::I32 => quote!(i32),
        ElementType::I64 => quote!(i64),
        ElementType::F32 => quote!(f32),
        ElementType::F64 => quote!(f64),
    }
}

fn rust_type(ty: ValueType) -> TokenStream {
    match ty {
        ValueType::Scalar(t) => rust_elem(t),
        ValueType::Pointer(t) | ValueType::Array(t, _) => {
            let t = rust_elem(t);
            quote!(*mut #t)
        }
    }
}

fn scalar_literal(value: Scalar) -> TokenStream {
    match value {
        Scalar::Bool(v) => quote!(#v),
        Scalar::I8(v) => quote!(#v),
        Scalar::I16(v) => quote!(#v),
        Scalar::I32(v) => quote!(#v),
        Scalar::I64(v) => quote!(#v),
        Scalar::F32(v) => quote!(#v),
        Scalar::F64(v) => quote!(#v),
    }
}

fn buffer_literal(buffer: &Buffer) -> TokenStream {
    let elems: Vec<TokenStream> = (0..buffer.len())
        .map(|i| scalar_literal(buffer.get(i)))
        .collect();
    quote!(vec![#(#elems),*])
}

fn render_memory(module: &Module) -> TokenStream {
    let mut fields = TokenStream::new();
    let mut inits = TokenStream::new();
    for (_, global) in module.globals() {
        let GlobalDef { name, ty, len, init, .. } = global;
        let ident = format_ident!("{}", name);
        let elem = rust_elem(*ty);
        fields.extend(quote! { pub #ident: Vec<#elem>, });
        let value = match init {
            Some(buffer) => buffer_literal(buffer),
            None => {
                let zero = scalar_literal(Scalar::zero(*ty));
                quote!(vec![#zero; #len])
            }
        };
        inits.extend(quote! { #ident: #value, });
    }
    quote! {
        pub struct Memory {
            #fields
        }
        impl Memory {
            pub fn new() -> Self {
                Self { #inits }
            }
        }
    }
}

fn render_host(module: &Module) -> Result<TokenStream, BackendError> {
    let mut methods = TokenStream::new();
    for (_, def) in module.functions() {
        if def.body.is_some() {
            continue;
        }
        let decl = &def.decl;
        let name = format_ident!("{}", sanitize(&decl.decorated_name()));
        let params: Vec<TokenStream> = decl
            .params()
            .iter()
            .enumerate()
            .map(|(i, &ty)| {
                let ident = format_ident!("a{}", i);
                let ty = rust_type(ty);
                quote!(#ident: #ty)
            })
            .collect();
        let ret = match decl.return_type() {
            Some(ty) => {
                let ty = rust_type(ty);
                quote!(-> #ty)
            }
            None => TokenStream::new(),
        };
        methods.extend(quote! {
            fn #name(&mut self, #(#params),*) #ret;
        });
    }
    Ok(quote! {
        pub trait Host {
            #methods
        }
    })
}

fn sanitize(symbol: &str) -> String {
    symbol
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn value_ident(value: ValueId) -> proc_macro2::Ident {
    format_ident!("v{}", value.0)
}

fn render_function(
    module: &Module,
    decl: &crate::module::FunctionDeclaration,
    body: &FunctionBody,
) -> Result<TokenStream, BackendError> {
    let name = format_ident!("{}", sanitize(&decl.decorated_name()));
    let params: Vec<TokenStream> = decl
        .params()
        .iter()
        .enumerate()
        .map(|(i, &ty)| {
            let ident = value_ident(ValueId(i));
            let ty = rust_type(ty);
            quote!(#ident: #ty)
        })
        .collect();
    let (ret, tail) = match decl.return_type() {
        Some(ty) => {
            let ty = rust_type(ty);
            (quote!(-> #ty), quote!(unreachable!()))
        }
        None => (TokenStream::new(), TokenStream::new()),
    };
    let attr = match decl.inline_hint() {
        InlineHint::Always => quote!(#[inline(always)]),
        InlineHint::Never => quote!(#[inline(never)]),
        InlineHint::Default => TokenStream::new(),
    };
    let block = render_block(module, &body.block)?;
    Ok(quote! {
        #attr
        #[allow(unused_variables, unused_mut, unused_unsafe, clippy::all)]
        pub fn #name(mem: &mut Memory, host: &mut dyn Host, #(#params),*) #ret {
            #block
            #tail
        }
    })
}

fn render_block(module: &Module, block: &Block) -> Result<TokenStream, BackendError> {
    let mut out = TokenStream::new();
    for inst in block.insts() {
        out.extend(render_inst(module, inst)?);
    }
    Ok(out)
}

fn render_inst(module: &Module, inst: &Inst) -> Result<TokenStream, BackendError> {
    Ok(match inst {
        Inst::Literal { dst, value } => {
            let dst = value_ident(*dst);
            let value = scalar_literal(*value);
            quote! { let #dst = #value; }
        }
        Inst::Alloca { dst, ty, len } => {
            let dst = value_ident(*dst);
            let backing = format_ident!("buf_{}", dst);
            let elem = rust_elem(*ty);
            let zero = scalar_literal(Scalar::zero(*ty));
            quote! {
                let mut #backing: Vec<#elem> = vec![#zero; #len];
                let #dst: *mut #elem = #backing.as_mut_ptr();
            }
        }
        Inst::GlobalRef { dst, global } => {
            let dst = value_ident(*dst);
            let field = format_ident!("{}", module.global(*global).name);
            let elem = rust_elem(module.global(*global).ty);
            quote! { let #dst: *mut #elem = mem.#field.as_mut_ptr(); }
        }
        Inst::Load { dst, ptr, index } => {
            let (dst, ptr, index) = (value_ident(*dst), value_ident(*ptr), value_ident(*index));
            quote! { let #dst = unsafe { *#ptr.offset(#index as isize) }; }
        }
        Inst::Store { ptr, index, value } => {
            let (ptr, index, value) = (value_ident(*ptr), value_ident(*index), value_ident(*value));
            quote! { unsafe { *#ptr.offset(#index as isize) = #value; } }
        }
        Inst::PtrOffset { dst, ptr, offset } => {
            let (dst, ptr, offset) = (value_ident(*dst), value_ident(*ptr), value_ident(*offset));
            quote! { let #dst = unsafe { #ptr.offset(#offset as isize) }; }
        }
        Inst::Binary { dst, op, lhs, rhs } => {
            let (dst, lhs, rhs) = (value_ident(*dst), value_ident(*lhs), value_ident(*rhs));
            let op = match op {
                BinOp::Add => quote!(+),
                BinOp::Sub => quote!(-),
                BinOp::Mul => quote!(*),
                BinOp::Div => quote!(/),
                BinOp::Rem => quote!(%),
                BinOp::And => quote!(&&),
                BinOp::Or => quote!(||),
            };
            quote! { let #dst = #lhs #op #rhs; }
        }
        Inst::Compare { dst, op, lhs, rhs } => {
            let (dst, lhs, rhs) = (value_ident(*dst), value_ident(*lhs), value_ident(*rhs));
            let op = match op {
                CmpOp::Eq => quote!(==),
                CmpOp::Ne => quote!(!=),
                CmpOp::Lt => quote!(<),
                CmpOp::Le => quote!(<=),
                CmpOp::Gt => quote!(>),
                CmpOp::Ge => quote!(>=),
            };
            quote! { let #dst = #lhs #op #rhs; }
        }
        Inst::Not { dst, value } => {
            let (dst, value) = (value_ident(*dst), value_ident(*value));
            quote! { let #dst = !#value; }
        }
        Inst::Cast { dst, value, to } => {
            let (dst, value) = (value_ident(*dst), value_ident(*value));
            let to = rust_elem(*to);
            quote! { let #dst = #value as #to; }
        }
        Inst::Call { dst, func, args } => {
            let def = module.function(*func);
            let callee = format_ident!("{}", sanitize(&def.decl.decorated_name()));
            let args: Vec<_> = args.iter().map(|a| value_ident(*a)).collect();
            let call = if def.body.is_some() {
                quote! { #callee(mem, host, #(#args),*) }
            } else {
                quote! { host.#callee(#(#args),*) }
            };
            match dst {
                Some(dst) => {
                    let dst = value_ident(*dst);
                    quote! { let #dst = #call; }
                }
                None => quote! { #call; },
            }
        }
        Inst::If { arms, otherwise } => {
            let mut chain = TokenStream::new();
            for (i, (cond, arm)) in arms.iter().enumerate() {
                let cond = value_ident(*cond);
                let arm = render_block(module, arm)?;
                if i == 0 {
                    chain.extend(quote! { if #cond { #arm } });
                } else {
                    chain.extend(quote! { else if #cond { #arm } });
                }
            }
            if let Some(otherwise) = otherwise {
                let otherwise = render_block(module, otherwise)?;
                chain.extend(quote! { else { #otherwise } });
            }
            chain
        }
        Inst::For {
            var,
            begin,
            end,
            body: loop_body,
        } => {
            let var = value_ident(*var);
            let (begin, end) = (value_ident(*begin), value_ident(*end));
            let loop_body = render_block(module, loop_body)?;
            quote! { for #var in #begin..#end { #loop_body } }
        }
        Inst::Parallel {
            workers,
            worker,
            captures: _,
            body: region,
        } => {
            let worker = value_ident(*worker);
            let workers = *workers as i64;
            let region = render_block(module, region)?;
            quote! { for #worker in 0i64..#workers { #region } }
        }
        Inst::Return { value } => match value {
            Some(value) => {
                let value = value_ident(*value);
                quote! { return #value; }
            }
            None => quote! { return; },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::FunctionDeclaration;

    fn sample_module() -> Module {
        let mut module = Module::new();
        let weights = module.add_constant("weights", Buffer::from_vec(vec![0.5f32, 0.25]));
        let out = module.add_global("out", ElementType::F32, 2);
        let sink = module
            .declare(
                FunctionDeclaration::new("emit_row")
                    .undecorated()
                    .parameters(vec![ValueType::Pointer(ElementType::F32)]),
            )
            .unwrap();
        module
            .define(FunctionDeclaration::new("scale").undecorated(), |fx| {
                let weights = fx.global_ref(weights);
                let out = fx.global_ref(out);
                fx.for_range(0, 2, |fx, i| {
                    let w = fx.load(weights, i)?;
                    let two = fx.literal(Scalar::F32(2.0));
                    let scaled = fx.mul(w, two)?;
                    fx.store(out, i, scaled)
                })?;
                fx.call(sink, &[out])?;
                fx.ret(None)
            })
            .unwrap();
        module
    }

    #[test]
    fn rendered_source_parses_as_rust() {
        let source = render(&sample_module()).unwrap();
        assert!(syn::parse_file(&source).is_ok());
    }

    #[test]
    fn rendering_exposes_memory_host_and_functions() {
        let source = render(&sample_module()).unwrap();
        assert!(source.contains("pub struct Memory"));
        assert!(source.contains("pub trait Host"));
        assert!(source.contains("fn emit_row"));
        assert!(source.contains("pub fn scale"));
        assert!(source.contains("weights"));
    }
}
