use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    spanned::Spanned,
    FnArg,
    ItemFn,
};

/// Checks the shape shared by both test attributes: an async fn whose first
/// argument is the runtime.
fn parse_test_fn(item: TokenStream, attr_name: &str, rt_type: &str) -> syn::Result<ItemFn> {
    let ast: ItemFn = syn::parse(item)?;
    let sig = &ast.sig;
    let name = &sig.ident;
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(
            sig.fn_token.span(),
            format!("#[{attr_name}] only works on async functions"),
        ));
    }
    let Some(FnArg::Typed(_)) = sig.inputs.first() else {
        return Err(syn::Error::new(
            sig.inputs.span(),
            format!("#[{attr_name}] requires `{name}` to have `rt: {rt_type}` as the first arg"),
        ));
    };
    Ok(ast)
}

/// Macro to use for tests that need ProdRuntime and tokio runtime, e.g. tests
/// against a real sqlite file where wall-clock time has to pass.
/// Example:
/// ```
/// #[orchestrator_macro::prod_rt_test]
/// async fn test_sqlite_queue(rt: ProdRuntime) -> anyhow::Result<()> {
///     let driver = SqliteQueueDriver::new(rt, &path, options)?;
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn prod_rt_test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = match parse_test_fn(item, "prod_rt_test", "ProdRuntime") {
        Ok(ast) => ast,
        Err(e) => return e.to_compile_error().into(),
    };
    let name = &ast.sig.ident;
    let output = &ast.sig.output;
    let body: TokenStream2 = quote! {
        let tokio = ::runtime::prod::ProdRuntime::init_tokio()?;
        let rt = ::runtime::prod::ProdRuntime::new(&tokio);
        let rt2 = rt.clone();
        let test_future = #name(rt);
        rt2.block_on(test_future)
    };
    wrap_test(&ast, name, output, body)
}

/// Macro to use for tests that need TestRuntime. Time is paused, so queue
/// timeouts and cache expirations can be reached with `rt.advance_time`.
/// Example:
/// ```
/// #[orchestrator_macro::test_runtime]
/// async fn test_query_queue(rt: TestRuntime) -> anyhow::Result<()> {
///     let queue = QueryQueue::new(rt, "test", handlers, options);
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn test_runtime(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = match parse_test_fn(item, "test_runtime", "TestRuntime") {
        Ok(ast) => ast,
        Err(e) => return e.to_compile_error().into(),
    };
    let name = &ast.sig.ident;
    let output = &ast.sig.output;
    let body: TokenStream2 = quote! {
        let __test_driver = ::runtime::testing::TestDriver::new();
        let rt = __test_driver.rt();
        let test_future = #name(rt);
        __test_driver.run_until(test_future)
    };
    wrap_test(&ast, name, output, body)
}

fn wrap_test(
    ast: &ItemFn,
    name: &syn::Ident,
    output: &syn::ReturnType,
    body: TokenStream2,
) -> TokenStream {
    let attrs = ast.attrs.iter();
    let gen = quote! {
        #[test]
        #( #attrs )*
        fn #name() #output {
            #ast
            // Set a consistent thread stack size regardless of environment.
            let builder = std::thread::Builder::new().stack_size(
                *::common::knobs::RUNTIME_STACK_SIZE);
            let handler = builder
                .spawn(|| {
                    #body
                })
                .unwrap();
            handler.join().unwrap()
        }
    };
    gen.into()
}
