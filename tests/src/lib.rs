//! Cross-crate test suite: IR properties, translator output,
//! backend lowering, the AOT object format, and end-to-end
//! execution scenarios.

#[cfg(test)]
mod aot;
#[cfg(test)]
mod backend;
#[cfg(test)]
mod exec;
#[cfg(test)]
mod frontend;
#[cfg(test)]
mod qir;
