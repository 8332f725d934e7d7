//! Turtle delta fragments against the fixture site.
//!
//! [`vsw_addition`] connects `dtn01:eth0` and `sw1:Ethernet0` on one vlan;
//! [`vsw_reduction`] removes the connection again.

use crate::SITE_URI;

const PREFIXES: &str = "@prefix nml: <http://schemas.ogf.org/nml/2013/03/base#> .
@prefix mrs: <http://schemas.ogf.org/mrs/2013/12/topology#> .
@prefix xsd: <http://www.w3.org/2001/XMLSchema#> .
";

/// URI of the vsw service of `sw1`.
pub fn vsw_service() -> String {
    format!("{}:sw1:service+vsw:sw1", SITE_URI)
}

/// URI of a vsw connection on `sw1`.
pub fn connection_uri(conn: &str) -> String {
    format!("{}:{}", vsw_service(), conn)
}

/// Addition fragment for a vsw connection between `dtn01:eth0` and
/// `sw1:Ethernet0`, with an optional ipv4 address on the host side.
pub fn vsw_addition(conn: &str, vlan: u16, address: Option<&str>, start: i64, end: i64) -> String {
    let service = vsw_service();
    let uri = connection_uri(conn);
    let host_port = format!("{}:dtn01:eth0:vlanport+{}", SITE_URI, vlan);
    let switch_port = format!("{}:sw1:Ethernet0:vlanport+{}", SITE_URI, vlan);
    let mut out = String::from(PREFIXES);
    out.push_str(&format!(
        "
<{service}> mrs:providesSubnet <{uri}> .

<{uri}> a mrs:SwitchingSubnet ;
    nml:encoding <http://schemas.ogf.org/nml/2012/10/ethernet#vlan> ;
    nml:labelSwapping \"false\" ;
    nml:existsDuring <{uri}:lifetime> ;
    nml:hasBidirectionalPort <{host_port}>, <{switch_port}> .

<{uri}:lifetime> a nml:Lifetime ;
    nml:start \"{start}\"^^xsd:long ;
    nml:end \"{end}\"^^xsd:long .

<{host_port}> a nml:BidirectionalPort ;
    nml:hasLabel <{host_port}:label+{vlan}> .
<{host_port}:label+{vlan}> a nml:Label ;
    nml:labeltype <http://schemas.ogf.org/nml/2012/10/ethernet#vlan> ;
    nml:value \"{vlan}\" .

<{switch_port}> a nml:BidirectionalPort ;
    nml:hasLabel <{switch_port}:label+{vlan}> .
<{switch_port}:label+{vlan}> a nml:Label ;
    nml:labeltype <http://schemas.ogf.org/nml/2012/10/ethernet#vlan> ;
    nml:value \"{vlan}\" .
"
    ));
    if let Some(address) = address {
        let node = format!("{}:ipv4-address+{}", host_port, address.replace('/', "_"));
        out.push_str(&format!(
            "
<{host_port}> mrs:hasNetworkAddress <{node}> .
<{node}> a mrs:NetworkAddress ;
    mrs:type \"ipv4-address\" ;
    mrs:value \"{address}\" .
"
        ));
    }
    out
}

/// Reduction fragment detaching a vsw connection from the service.
pub fn vsw_reduction(conn: &str) -> String {
    format!(
        "{}\n<{}> mrs:providesSubnet <{}> .\n",
        PREFIXES,
        vsw_service(),
        connection_uri(conn)
    )
}
