//! Ordered handler chains.
//!
//! A [`Chain`] runs its links in insertion order. Each link either passes
//! the (possibly rewritten) argument on with [`Flow::Continue`] or ends the
//! run with [`Flow::Stop`]. If every link continues, a fallback produces the
//! result.
//!
//! [`VerifierChain`] builds item verification out of such links: route by
//! name prefix, reject unsigned items, accept only certain signature types.

use std::sync::Arc;

use crate::crypto::Verifier;
use crate::error::{CoreError, Result};
use crate::item::{NamedItem, SignatureType};
use crate::name::Name;

/// Outcome of a single link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow<A, R> {
    Continue(A),
    Stop(R),
}

type Link<A, R> = Box<dyn Fn(A) -> Flow<A, R> + Send + Sync>;

/// An ordered list of links.
pub struct Chain<A, R> {
    links: Vec<Link<A, R>>,
}

impl<A, R> Chain<A, R> {
    pub fn new() -> Self {
        Self { links: Vec::new() }
    }

    /// Append a link.
    pub fn with(mut self, link: impl Fn(A) -> Flow<A, R> + Send + Sync + 'static) -> Self {
        self.links.push(Box::new(link));
        self
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Run the links in order until one stops.
    pub fn run(&self, arg: A, fallback: impl FnOnce(A) -> R) -> R {
        let mut arg = arg;
        for link in &self.links {
            match link(arg) {
                Flow::Continue(next) => arg = next,
                Flow::Stop(result) => return result,
            }
        }
        fallback(arg)
    }
}

impl<A, R> Default for Chain<A, R> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Verifier`] assembled from chain links.
///
/// Items no link decides on are rejected.
#[derive(Default)]
pub struct VerifierChain {
    chain: Chain<NamedItem, Result<()>>,
}

impl VerifierChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject items that carry no signature.
    pub fn reject_unsigned(mut self) -> Self {
        self.chain = self.chain.with(|item: NamedItem| {
            if item.is_signed() {
                Flow::Continue(item)
            } else {
                Flow::Stop(Err(CoreError::MissingSignature(item.name.to_string())))
            }
        });
        self
    }

    /// Items under `prefix` are decided by `verifier`.
    pub fn under(mut self, prefix: Name, verifier: Arc<dyn Verifier>) -> Self {
        self.chain = self.chain.with(move |item: NamedItem| {
            if prefix.is_prefix_of(&item.name) {
                Flow::Stop(verifier.verify(&item))
            } else {
                Flow::Continue(item)
            }
        });
        self
    }

    /// Items signed with `sig_type` are decided by `verifier`.
    pub fn by_type(mut self, sig_type: SignatureType, verifier: Arc<dyn Verifier>) -> Self {
        self.chain = self.chain.with(move |item: NamedItem| {
            match item.signature.as_ref().map(|s| s.sig_type) {
                Some(t) if t == sig_type => Flow::Stop(verifier.verify(&item)),
                _ => Flow::Continue(item),
            }
        });
        self
    }
}

impl Verifier for VerifierChain {
    fn verify(&self, item: &NamedItem) -> Result<()> {
        self.chain
            .run(item.clone(), |item| Err(CoreError::Untrusted(item.name.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DigestSigning, Ed25519Signer, Ed25519Verifier, Keypair, Signer};

    #[test]
    fn test_chain_continue_rewrites_and_stop_short_circuits() {
        let chain: Chain<u32, String> = Chain::new()
            .with(|n| Flow::Continue(n * 2))
            .with(|n| if n > 10 { Flow::Stop(format!("big {n}")) } else { Flow::Continue(n) })
            .with(|n| Flow::Continue(n + 1));

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.run(3, |n| format!("small {n}")), "small 7");
        assert_eq!(chain.run(6, |n| format!("small {n}")), "big 12");
    }

    #[test]
    fn test_empty_chain_uses_fallback() {
        let chain: Chain<&str, usize> = Chain::default();
        assert!(chain.is_empty());
        assert_eq!(chain.run("abc", str::len), 3);
    }

    #[test]
    fn test_verifier_chain_routes_by_prefix() {
        let keypair = Keypair::from_seed(&[1u8; 32]);
        let key_name = Name::parse("/app/KEY").unwrap();
        let ed = Ed25519Verifier::new().trust(key_name.clone(), keypair.public_key());

        let verifier = VerifierChain::new()
            .reject_unsigned()
            .under(Name::parse("/app/secure").unwrap(), Arc::new(ed))
            .by_type(SignatureType::Digest, Arc::new(DigestSigning));

        let mut signed = NamedItem::new(Name::parse("/app/secure/1").unwrap(), &b"a"[..]);
        Ed25519Signer::new(keypair, key_name).sign(&mut signed).unwrap();
        verifier.verify(&signed).unwrap();

        let mut digest_only = NamedItem::new(Name::parse("/app/secure/2").unwrap(), &b"b"[..]);
        DigestSigning.sign(&mut digest_only).unwrap();
        assert!(verifier.verify(&digest_only).is_err());

        let mut open = NamedItem::new(Name::parse("/app/open/1").unwrap(), &b"c"[..]);
        DigestSigning.sign(&mut open).unwrap();
        verifier.verify(&open).unwrap();

        let unsigned = NamedItem::new(Name::parse("/app/open/2").unwrap(), &b"d"[..]);
        assert!(matches!(
            verifier.verify(&unsigned),
            Err(CoreError::MissingSignature(_))
        ));
    }

    #[test]
    fn test_verifier_chain_rejects_undecided() {
        let verifier = VerifierChain::new();
        let mut it = NamedItem::new(Name::parse("/x").unwrap(), &b""[..]);
        DigestSigning.sign(&mut it).unwrap();
        assert!(matches!(verifier.verify(&it), Err(CoreError::Untrusted(_))));
    }
}
